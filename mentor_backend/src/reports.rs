use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::conversation::transcript;
use crate::database::CoachDatabase;
use crate::llm_client::{summarize, GenerationRequest, Message, TextGenerator};
use crate::profile::render_profile;

pub const SUMMARY_FALLBACK: &str = "Eine Zusammenfassung konnte nicht erstellt werden.";
const MAX_REVIEW_GOALS: usize = 20;

/// A stored insight or periodic review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub user_id: String,
    pub thema: String,
    pub inhalt: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(user_id: &str, thema: &str, inhalt: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            thema: thema.to_string(),
            inhalt: inhalt.to_string(),
            timestamp: now,
        }
    }
}

pub fn render_memory(entries: &[MemoryEntry]) -> String {
    if entries.is_empty() {
        return "Keine Langzeiterinnerungen vorhanden.".to_string();
    }
    entries
        .iter()
        .map(|e| format!("- {} ({}): {}", e.thema, e.timestamp.format("%d.%m.%Y"), e.inhalt))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    Weekly,
    Monthly,
}

impl ReportKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ReportKind::Weekly => "Wochen",
            ReportKind::Monthly => "Monats",
        }
    }

    /// Stored topic label, e.g. "Wochenrückblick".
    pub fn label(self) -> &'static str {
        match self {
            ReportKind::Weekly => "Wochenrückblick",
            ReportKind::Monthly => "Monatsrückblick",
        }
    }

    pub fn window_days(self) -> i64 {
        match self {
            ReportKind::Weekly => 7,
            ReportKind::Monthly => 30,
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        match raw {
            "Wochenrückblick" => Some(ReportKind::Weekly),
            "Monatsrückblick" => Some(ReportKind::Monthly),
            _ => None,
        }
    }

    /// Dedup window containing `now`: the ISO week for weekly reviews,
    /// the calendar month for monthly ones. Half-open.
    pub fn period_bounds(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.date_naive();
        let (start, end) = match self {
            ReportKind::Weekly => {
                let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
                (monday, monday + Duration::days(7))
            }
            ReportKind::Monthly => {
                let first = first_of_month(today);
                (first, first_of_month(first + Duration::days(32)))
            }
        };
        (start_of_day(start), start_of_day(end))
    }

    fn missing_text(self) -> String {
        let label = self.label();
        format!(
            "Kein {} verfügbar. Er wird {}s generiert.",
            label,
            label.to_lowercase().replace("rückblick", "")
        )
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    first_of_month(first_of_month(date) + Duration::days(32)) - Duration::days(1)
}

/// Which review is due at `now`. The last day of a month wins over Sunday.
pub fn due_report(now: DateTime<Utc>) -> Option<ReportKind> {
    let today = now.date_naive();
    if today == last_day_of_month(today) {
        Some(ReportKind::Monthly)
    } else if today.weekday() == Weekday::Sun {
        Some(ReportKind::Weekly)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Ungültiger Berichtstyp angefragt.")]
    UnknownType(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Response of `GET /bericht/automatisch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutomaticReview {
    pub typ: Option<String>,
    pub inhalt: Option<String>,
}

pub struct ReviewGenerator {
    db: Arc<CoachDatabase>,
    generator: Arc<dyn TextGenerator>,
    models: ModelConfig,
    recent_threshold: usize,
}

impl ReviewGenerator {
    pub fn new(
        db: Arc<CoachDatabase>,
        generator: Arc<dyn TextGenerator>,
        models: ModelConfig,
        recent_threshold: usize,
    ) -> Self {
        Self {
            db,
            generator,
            models,
            recent_threshold,
        }
    }

    /// Generate the due review unless one already exists for this period.
    pub async fn run_automatic_review(&self, user_id: &str, now: DateTime<Utc>) -> Result<AutomaticReview> {
        let Some(kind) = due_report(now) else {
            return Ok(AutomaticReview::default());
        };

        let (start, end) = kind.period_bounds(now);
        if self.db.memory_exists_between(user_id, kind.label(), start, end)? {
            tracing::debug!("{} for {} already stored for this period", kind.label(), user_id);
            return Ok(AutomaticReview {
                typ: Some(kind.label().to_string()),
                inhalt: None,
            });
        }

        tracing::info!("Generating {} for {}", kind.label(), user_id);
        let inhalt = self.generate_review(kind, user_id, now).await?;
        Ok(AutomaticReview {
            typ: Some(kind.label().to_string()),
            inhalt: Some(inhalt),
        })
    }

    /// Build the digest for the trailing window, ask the model for a review
    /// and store it under the period label.
    pub async fn generate_review(&self, kind: ReportKind, user_id: &str, now: DateTime<Utc>) -> Result<String> {
        let since = now - Duration::days(kind.window_days());

        let entries = self.db.conversation_entries_since(user_id, since)?;
        let conversations = if entries.is_empty() {
            "Es gab keine relevanten Gespräche in diesem Zeitraum.".to_string()
        } else if entries.len() > self.recent_threshold {
            let split = entries.len() - self.recent_threshold;
            let older = transcript(&entries[..split]).join("\n");
            let summary = match summarize(
                self.generator.as_ref(),
                &self.models.summary,
                &older,
                200,
                "wichtige Punkte und Muster",
            )
            .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("Review summary for {} failed: {:#}", user_id, e);
                    SUMMARY_FALLBACK.to_string()
                }
            };
            format!(
                "Zusammenfassung früherer Gespräche:\n{}\n\nLetzte Gespräche:\n{}",
                summary,
                transcript(&entries[split..]).join("\n")
            )
        } else {
            transcript(&entries).join("\n")
        };

        let goals = self.db.goals_created_since(user_id, since)?;
        let goals_text = if goals.is_empty() {
            "Keine neuen Ziele in diesem Zeitraum.".to_string()
        } else {
            let skip = goals.len().saturating_sub(MAX_REVIEW_GOALS);
            goals[skip..]
                .iter()
                .map(|g| format!("- {} ({})", g.titel, g.status))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let profile_text = render_profile(&self.db.list_profile(user_id)?);

        let routines = self.db.list_routines(user_id)?;
        let routines_text = if routines.is_empty() {
            "Keine Routinen vorhanden.".to_string()
        } else {
            routines
                .iter()
                .map(|r| {
                    format!(
                        "- {} (Tag: {}, Heute erledigt: {}, Verpasst: {})",
                        r.task,
                        r.day,
                        if r.checked { "Ja" } else { "Nein" },
                        r.missed_count
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let previous = self
            .db
            .latest_memory_for_topic(user_id, kind.label())?
            .map(|m| m.inhalt)
            .unwrap_or_else(|| "Kein früherer Bericht dieses Typs vorhanden.".to_string());

        let prompt = build_review_prompt(
            kind,
            &conversations,
            &goals_text,
            &profile_text,
            &routines_text,
            &previous,
        );
        let system = format!(
            "Du bist ein persönlicher Beobachter und Coach. Liste die im letzten {zeitraum} besprochenen \
             Themen und den Status von Zielen und Routinen rückblickend knapp auf.\n\
             Analysiere Trends, erkenne Fortschritte oder Herausforderungen und gib konkrete, \
             umsetzbare Vorschläge für die Zukunft.",
            zeitraum = kind.prefix()
        );

        let request = GenerationRequest::new(
            self.models.review.clone(),
            vec![Message::system(system), Message::user(prompt)],
        )
        .max_tokens(300)
        .temperature(0.7);

        let review = self.generator.generate(request).await?;
        let review = review.trim().to_string();

        self.db
            .insert_memory_entry(&MemoryEntry::new(user_id, kind.label(), &review, now))?;
        Ok(review)
    }

    /// Newest stored review for a label, or the "not yet generated" text.
    pub fn latest_report(&self, user_id: &str, report_type_name: &str) -> Result<String, ReportError> {
        let kind = ReportKind::from_label(report_type_name)
            .ok_or_else(|| ReportError::UnknownType(report_type_name.to_string()))?;
        Ok(self
            .db
            .latest_memory_for_topic(user_id, kind.label())?
            .map(|m| m.inhalt)
            .unwrap_or_else(|| kind.missing_text()))
    }
}

fn build_review_prompt(
    kind: ReportKind,
    conversations: &str,
    goals: &str,
    profile: &str,
    routines: &str,
    previous: &str,
) -> String {
    format!(
        "Hier sind die Informationen für den {}-Rückblick:\n\n\
         ## Gespräche\n{}\n\n\
         ## Ziele (Status)\n{}\n\n\
         ## Routinen\n{}\n\n\
         ## Benutzerprofil\n{}\n\n\
         ## Vorheriger Bericht\n{}\n\n\
         Bitte gib einen motivierenden und tiefgehenden Rückblick, der wirklich analysiert, \
         was passiert ist und konkrete, umsetzbare nächste Schritte vorschlägt.",
        kind.prefix(),
        conversations,
        goals,
        routines,
        profile,
        previous,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationEntry;
    use crate::testing::{shared_database, ScriptedGenerator};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 18, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn reviewer(db: Arc<CoachDatabase>, generator: Arc<ScriptedGenerator>) -> ReviewGenerator {
        ReviewGenerator::new(db, generator, ModelConfig::default(), 10)
    }

    #[test]
    fn last_day_handles_every_month_length() {
        assert_eq!(last_day_of_month(date(2026, 2, 10)), date(2026, 2, 28));
        assert_eq!(last_day_of_month(date(2028, 2, 1)), date(2028, 2, 29));
        assert_eq!(last_day_of_month(date(2026, 4, 30)), date(2026, 4, 30));
        assert_eq!(last_day_of_month(date(2026, 1, 31)), date(2026, 1, 31));
        assert_eq!(last_day_of_month(date(2026, 12, 5)), date(2026, 12, 31));
    }

    #[test]
    fn cadence_prefers_month_end_over_sunday() {
        // Sunday mid-month
        assert_eq!(due_report(at(2026, 3, 15)), Some(ReportKind::Weekly));
        // Saturday, 28-day February
        assert_eq!(due_report(at(2026, 2, 28)), Some(ReportKind::Monthly));
        // Leap February: the 28th is ordinary, the 29th is month end
        assert_eq!(due_report(at(2028, 2, 28)), None);
        assert_eq!(due_report(at(2028, 2, 29)), Some(ReportKind::Monthly));
        // 30-day month ending on a Thursday
        assert_eq!(due_report(at(2026, 4, 30)), Some(ReportKind::Monthly));
        // 31-day month ending on a Sunday
        assert_eq!(due_report(at(2026, 5, 31)), Some(ReportKind::Monthly));
        assert_eq!(due_report(at(2026, 3, 11)), None);
    }

    #[test]
    fn period_bounds_cover_iso_week_and_calendar_month() {
        let (start, end) = ReportKind::Weekly.period_bounds(at(2026, 3, 15));
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap());

        let (start, end) = ReportKind::Monthly.period_bounds(at(2026, 12, 31));
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn automatic_review_is_idempotent_per_period() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(ScriptedGenerator::always("Eine gute Woche."));
        let reviews = reviewer(db.clone(), generator.clone());
        let sunday = at(2026, 3, 15);

        let first = reviews.run_automatic_review("u1", sunday).await.expect("first");
        assert_eq!(first.typ.as_deref(), Some("Wochenrückblick"));
        assert_eq!(first.inhalt.as_deref(), Some("Eine gute Woche."));

        let second = reviews
            .run_automatic_review("u1", sunday + Duration::hours(3))
            .await
            .expect("second");
        assert_eq!(second.typ.as_deref(), Some("Wochenrückblick"));
        assert_eq!(second.inhalt, None);
        assert_eq!(generator.requests().len(), 1);
        assert_eq!(
            db.memory_entries_for_topic("u1", "Wochenrückblick", 10)
                .expect("stored")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn nothing_is_due_midweek() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(ScriptedGenerator::failing());
        let review = reviewer(db, generator.clone())
            .run_automatic_review("u1", at(2026, 3, 11))
            .await
            .expect("run");
        assert_eq!(review, AutomaticReview::default());
        assert!(generator.requests().is_empty());
    }

    #[tokio::test]
    async fn long_windows_summarize_older_entries() {
        let (_dir, db) = shared_database();
        let now = at(2026, 3, 15);
        for i in 0..12 {
            db.insert_conversation_entry(&ConversationEntry::user_reply(
                "u1",
                &format!("Nachricht {}", i),
                "Antwort",
                now - Duration::hours(24 - i),
            ))
            .expect("entry");
        }
        let generator = Arc::new(
            ScriptedGenerator::new()
                .then_err("summary down")
                .then_ok("Rückblick"),
        );
        let reviews = reviewer(db.clone(), generator.clone());

        let text = reviews
            .generate_review(ReportKind::Weekly, "u1", now)
            .await
            .expect("review");
        assert_eq!(text, "Rückblick");

        let summary_request = &generator.requests()[0];
        assert_eq!(summary_request.model, "gpt-3.5-turbo");
        assert!(generator.prompt(0).contains("Nachricht 0"));
        assert!(generator.prompt(0).contains("Nachricht 1"));
        assert!(!generator.prompt(0).contains("Nachricht 2"));

        let review_prompt = generator.prompt(1);
        assert!(review_prompt.contains(SUMMARY_FALLBACK));
        assert!(review_prompt.contains("User: Nachricht 11"));
        assert_eq!(generator.requests()[1].max_tokens, Some(300));
    }

    #[tokio::test]
    async fn model_failure_stores_nothing() {
        let (_dir, db) = shared_database();
        let reviews = reviewer(db.clone(), Arc::new(ScriptedGenerator::failing()));
        assert!(reviews
            .run_automatic_review("u1", at(2026, 2, 28))
            .await
            .is_err());
        assert!(db
            .latest_memory_for_topic("u1", "Monatsrückblick")
            .expect("query")
            .is_none());
    }

    #[test]
    fn latest_report_validates_label() {
        let (_dir, db) = shared_database();
        let reviews = reviewer(db.clone(), Arc::new(ScriptedGenerator::failing()));

        assert!(matches!(
            reviews.latest_report("u1", "Jahresrückblick"),
            Err(ReportError::UnknownType(_))
        ));
        assert_eq!(
            reviews.latest_report("u1", "Wochenrückblick").expect("text"),
            "Kein Wochenrückblick verfügbar. Er wird wochens generiert."
        );

        db.insert_memory_entry(&MemoryEntry::new("u1", "Monatsrückblick", "Alt", at(2026, 1, 31)))
            .expect("old");
        db.insert_memory_entry(&MemoryEntry::new("u1", "Monatsrückblick", "Neu", at(2026, 2, 28)))
            .expect("new");
        assert_eq!(
            reviews.latest_report("u1", "Monatsrückblick").expect("text"),
            "Neu"
        );
    }
}
