use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::conversation::{transcript, ConversationEntry};
use crate::database::CoachDatabase;
use crate::llm_client::{GenerationRequest, Message, TextGenerator};
use crate::profile::render_profile;
use crate::reports::{MemoryEntry, ReportKind};
use crate::routines::{render_routine_overview, repeatedly_missed, RoutineTracker};

pub const FIRST_QUESTION: &str =
    "Was möchtest du heute angehen? Gibt es ein neues Thema, über das du sprechen möchtest?";
pub const EMPTY_QUESTION_FALLBACK: &str = "Was möchtest du heute erreichen oder klären?";
pub const FAILED_QUESTION_FALLBACK: &str =
    "Es gab ein Problem beim Generieren der Einstiegsfrage. Was möchtest du heute besprechen?";

const MONTHLY_REPORT_LIMIT: usize = 10;
const WEEKLY_REPORT_LIMIT: usize = 4;
const GOAL_LIMIT: usize = 5;
const ROUTINE_OVERVIEW_LIMIT: usize = 10;

const TOPIC_SUGGESTIONS: &[&str] = &[
    "Langfristige Ziele",
    "Bestehende Routinen",
    "Neue Routinen",
    "Selbstreflexion",
    "Freizeitgestaltung",
    "Umgang mit Herausforderungen",
    "Lernprozesse",
    "Beziehungen pflegen",
    "Umgang mit Energie und Erholung",
    "Persönliche Werte",
    "Zukunftsvisionen",
    "Umgang mit Ängsten oder Sorgen",
    "Erfolge feiern",
];

/// Voice of the opening question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    CuriousFriend,
    /// Rare playful variant speaking as "the universe".
    Universe,
}

impl Persona {
    fn instructions(self) -> &'static str {
        match self {
            Persona::CuriousFriend => {
                "Du bist eine offene Freundin, die ein Gespräch mit mir starten will. Formuliere EINE \
                 einzige, konkrete, lockere und personalisierte Frage, entweder basierend auf dem \
                 bereitgestellten Kontext oder zu einem ganz neuen Thema, das noch nie besprochen wurde.\n\
                 Du willst mehr über den Benutzer erfahren, ihn aber nicht mit komplizierten Fragen überfordern.\n\
                 Vermeide zusammengesetzte Fragen oder Fragen, die mit 'und' verbunden sind."
            }
            Persona::Universe => {
                "Du bist hypothetisch die Simulation oder das Universum und möchtest dem Nutzer heute \
                 einen konkreten Hinweis geben. Tue so, als hättest du tatsächlich Kontakt zum Universum \
                 und wüsstest etwas Wichtiges über seinen heutigen Tag.\n\
                 Sei sehr konkret und weise auf eine bestimmte Aktion, Einstellung oder ein Ereignis hin. \
                 Bleibe dabei einfühlsam und motivierend."
            }
        }
    }
}

/// Picks the persona for one opening question.
pub trait PersonaSelector: Send + Sync {
    fn select(&self) -> Persona;
}

pub struct RandomPersonaSelector {
    universe_probability: f64,
}

impl RandomPersonaSelector {
    pub fn new(universe_probability: f64) -> Self {
        let universe_probability = if universe_probability.is_finite() {
            universe_probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            universe_probability,
        }
    }
}

impl PersonaSelector for RandomPersonaSelector {
    fn select(&self) -> Persona {
        if rand::thread_rng().gen_bool(self.universe_probability) {
            Persona::Universe
        } else {
            Persona::CuriousFriend
        }
    }
}

/// Always the same persona.
pub struct FixedPersona(pub Persona);

impl PersonaSelector for FixedPersona {
    fn select(&self) -> Persona {
        self.0
    }
}

#[derive(Debug, Clone, Default)]
struct QuestionContext {
    history: Vec<String>,
    avoid: Vec<String>,
    profile: String,
    reports: String,
    goals: String,
    routines: String,
    struggling_routines: Vec<String>,
}

pub struct EntryQuestionGenerator {
    db: Arc<CoachDatabase>,
    generator: Arc<dyn TextGenerator>,
    selector: Arc<dyn PersonaSelector>,
    model: String,
    history_limit: usize,
    avoid_count: usize,
}

impl EntryQuestionGenerator {
    pub fn new(
        db: Arc<CoachDatabase>,
        generator: Arc<dyn TextGenerator>,
        selector: Arc<dyn PersonaSelector>,
        model: String,
        history_limit: usize,
        avoid_count: usize,
    ) -> Self {
        Self {
            db,
            generator,
            selector,
            model,
            history_limit,
            avoid_count,
        }
    }

    /// Opening question for a new session. Model failures yield a fixed
    /// question that is not stored.
    pub async fn start_interaction(&self, user_id: &str, now: DateTime<Utc>) -> Result<String> {
        if self.db.count_conversation_entries(user_id)? == 0 {
            self.persist(user_id, FIRST_QUESTION, now);
            return Ok(FIRST_QUESTION.to_string());
        }

        let context = self.gather_context(user_id, now);
        let persona = self.selector.select();
        tracing::debug!("Entry question for {} uses persona {:?}", user_id, persona);

        let request = GenerationRequest::new(
            self.model.clone(),
            vec![Message::user(build_question_prompt(persona, &context))],
        )
        .max_tokens(60)
        .temperature(0.7);

        let question = match self.generator.generate(request).await {
            Ok(raw) => {
                let cleaned = raw.trim().trim_matches('"').trim().to_string();
                if cleaned.is_empty() {
                    EMPTY_QUESTION_FALLBACK.to_string()
                } else {
                    cleaned
                }
            }
            Err(e) => {
                tracing::error!("Entry question generation for {} failed: {:#}", user_id, e);
                return Ok(FAILED_QUESTION_FALLBACK.to_string());
            }
        };

        self.persist(user_id, &question, now);
        Ok(question)
    }

    fn persist(&self, user_id: &str, question: &str, now: DateTime<Utc>) {
        let entry = ConversationEntry::assistant_question(user_id, question, now);
        if let Err(e) = self.db.insert_conversation_entry(&entry) {
            tracing::warn!("Failed to store entry question for {}: {:#}", user_id, e);
        }
    }

    fn gather_context(&self, user_id: &str, now: DateTime<Utc>) -> QuestionContext {
        let mut context = QuestionContext::default();

        match self.db.recent_conversation_entries(user_id, self.history_limit) {
            Ok(entries) => context.history = transcript(&entries),
            Err(e) => tracing::warn!("History unavailable for {}: {:#}", user_id, e),
        }

        match self.db.recent_assistant_questions(user_id, self.avoid_count) {
            Ok(questions) => context.avoid = questions,
            Err(e) => tracing::warn!("Recent questions unavailable for {}: {:#}", user_id, e),
        }

        context.profile = match self.db.list_profile(user_id) {
            Ok(attributes) => render_profile(&attributes),
            Err(e) => {
                tracing::warn!("Profile unavailable for {}: {:#}", user_id, e);
                render_profile(&[])
            }
        };

        let mut reports: Vec<MemoryEntry> = Vec::new();
        for (kind, limit) in [
            (ReportKind::Monthly, MONTHLY_REPORT_LIMIT),
            (ReportKind::Weekly, WEEKLY_REPORT_LIMIT),
        ] {
            match self.db.memory_entries_for_topic(user_id, kind.label(), limit) {
                Ok(mut entries) => reports.append(&mut entries),
                Err(e) => tracing::warn!("{} unavailable for {}: {:#}", kind.label(), user_id, e),
            }
        }
        context.reports = if reports.is_empty() {
            "Bisher keine Berichte verfügbar.".to_string()
        } else {
            reports
                .iter()
                .map(|r| format!("{}: {}", r.thema, r.inhalt))
                .collect::<Vec<_>>()
                .join("\n")
        };

        context.goals = match self.db.list_goals(user_id, Some(GOAL_LIMIT)) {
            Ok(goals) if !goals.is_empty() => goals
                .iter()
                .map(|g| format!("- {} (Status: {})", g.titel, g.status))
                .collect::<Vec<_>>()
                .join("\n"),
            Ok(_) => "Bisher keine Ziele erfasst.".to_string(),
            Err(e) => {
                tracing::warn!("Goals unavailable for {}: {:#}", user_id, e);
                "Bisher keine Ziele erfasst.".to_string()
            }
        };

        let tracker = RoutineTracker::new(self.db.clone());
        context.routines = match tracker.all_routines(user_id) {
            Ok(mut routines) => {
                routines.truncate(ROUTINE_OVERVIEW_LIMIT);
                render_routine_overview(&routines)
            }
            Err(e) => {
                tracing::warn!("Routines unavailable for {}: {:#}", user_id, e);
                render_routine_overview(&[])
            }
        };

        let today = now.date_naive();
        match tracker.list_routines(user_id, now) {
            Ok(views) => {
                context.struggling_routines = views
                    .iter()
                    .filter(|v| v.date == today && !v.routine.checked)
                    .filter(|v| repeatedly_missed(&v.routine, today))
                    .map(|v| v.routine.task.clone())
                    .collect();
            }
            Err(e) => tracing::warn!("Today's routines unavailable for {}: {:#}", user_id, e),
        }

        context
    }
}

fn build_question_prompt(persona: Persona, context: &QuestionContext) -> String {
    let avoid = if context.avoid.is_empty() {
        "(keine)".to_string()
    } else {
        context
            .avoid
            .iter()
            .map(|q| format!("- {}", q))
            .collect::<Vec<_>>()
            .join("\n")
    };

    if persona == Persona::Universe {
        return format!(
            "{}\n\n\
             ## Vermeide diese kürzlich gestellten Einstiegsfragen\n{}\n\n\
             Antworte mit einem einzigen kurzen Satz.",
            persona.instructions(),
            avoid
        );
    }

    let history = if context.history.is_empty() {
        "(keine)".to_string()
    } else {
        context.history.join("\n")
    };
    let struggling = if context.struggling_routines.is_empty() {
        "(keine)".to_string()
    } else {
        context.struggling_routines.join(", ")
    };

    format!(
        "{}\n\n\
         ## Bisheriger Verlauf\n{}\n\n\
         ## Benutzerprofil\n{}\n\n\
         ## Aktuelle Berichte\n{}\n\n\
         ## Aktuelle Ziele\n{}\n\n\
         ## Übersicht aller Routinen\n{}\n\n\
         ## Wiederholt unerfüllte Routinen heute\n{}\n\n\
         ## Vermeide diese kürzlich gestellten Einstiegsfragen\n{}\n\n\
         Mögliche Themenbereiche: {}\n\n\
         Nutze den Kontext für die Personalisierung. \
         Halte die Frage sehr kurz, idealerweise in einem Satz.",
        persona.instructions(),
        history,
        context.profile,
        context.reports,
        context.goals,
        context.routines,
        struggling,
        avoid,
        TOPIC_SUGGESTIONS.join("; "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::EntryKind;
    use crate::routines::Routine;
    use crate::testing::{shared_database, ScriptedGenerator};
    use chrono::{Duration, NaiveDate, TimeZone, Weekday};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, 8, 0, 0).unwrap()
    }

    fn questions(
        db: Arc<CoachDatabase>,
        generator: Arc<ScriptedGenerator>,
        persona: Persona,
    ) -> EntryQuestionGenerator {
        EntryQuestionGenerator::new(
            db,
            generator,
            Arc::new(FixedPersona(persona)),
            "gpt-4".to_string(),
            30,
            8,
        )
    }

    #[tokio::test]
    async fn first_contact_persists_fixed_question() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(ScriptedGenerator::failing());
        let question = questions(db.clone(), generator.clone(), Persona::CuriousFriend)
            .start_interaction("u1", now())
            .await
            .expect("question");

        assert_eq!(question, FIRST_QUESTION);
        assert!(generator.requests().is_empty());
        let entries = db.recent_conversation_entries("u1", 5).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::AssistantQuestion);
        assert!(entries[0].user_input.is_none());
        assert_eq!(entries[0].ai_prompt.as_deref(), Some(FIRST_QUESTION));
    }

    #[tokio::test]
    async fn later_questions_avoid_recent_ones() {
        let (_dir, db) = shared_database();
        db.insert_conversation_entry(&ConversationEntry::assistant_question(
            "u1",
            "Was liest du gerade?",
            now() - Duration::days(1),
        ))
        .expect("seed");
        let mut struggling = Routine::new("u1", "Joggen", Weekday::Wed, "07:00", now() - Duration::days(60));
        struggling.missed_dates = vec![
            NaiveDate::from_ymd_opt(2026, 2, 18).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 25).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
        ];
        struggling.missed_count = 3;
        db.insert_routine(&struggling).expect("routine");

        let generator = Arc::new(ScriptedGenerator::always("  \"Wie war dein Wochenende?\" "));
        let question = questions(db.clone(), generator.clone(), Persona::CuriousFriend)
            .start_interaction("u1", now())
            .await
            .expect("question");

        assert_eq!(question, "Wie war dein Wochenende?");
        let prompt = generator.prompt(0);
        assert!(prompt.contains("- Was liest du gerade?"));
        assert!(prompt.contains("## Wiederholt unerfüllte Routinen heute\nJoggen"));
        let request = &generator.requests()[0];
        assert_eq!(request.max_tokens, Some(60));
        assert_eq!(request.model, "gpt-4");

        let asked = db.recent_assistant_questions("u1", 8).expect("asked");
        assert_eq!(asked[0], "Wie war dein Wochenende?");
    }

    #[tokio::test]
    async fn universe_persona_changes_the_prompt() {
        let (_dir, db) = shared_database();
        db.insert_conversation_entry(&ConversationEntry::assistant_question("u1", "Frage?", now()))
            .expect("seed");
        let generator = Arc::new(ScriptedGenerator::always("Heute lohnt sich ein Umweg."));
        questions(db, generator.clone(), Persona::Universe)
            .start_interaction("u1", now())
            .await
            .expect("question");
        assert!(generator.prompt(0).contains("Universum"));
        assert!(!generator.prompt(0).contains("Übersicht aller Routinen"));
    }

    #[tokio::test]
    async fn empty_and_failed_generation_fall_back() {
        let (_dir, db) = shared_database();
        db.insert_conversation_entry(&ConversationEntry::assistant_question("u1", "Frage?", now()))
            .expect("seed");
        let generator = Arc::new(ScriptedGenerator::new().then_ok("   ").then_err("timeout"));
        let questions = questions(db.clone(), generator, Persona::CuriousFriend);

        let empty = questions.start_interaction("u1", now()).await.expect("empty");
        assert_eq!(empty, EMPTY_QUESTION_FALLBACK);

        let failed = questions.start_interaction("u1", now()).await.expect("failed");
        assert_eq!(failed, FAILED_QUESTION_FALLBACK);
        assert_eq!(db.count_conversation_entries("u1").expect("count"), 2);
    }

    #[test]
    fn random_selector_respects_extremes() {
        assert_eq!(RandomPersonaSelector::new(0.0).select(), Persona::CuriousFriend);
        assert_eq!(RandomPersonaSelector::new(1.0).select(), Persona::Universe);
    }
}
