use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::CoachDatabase;
use crate::llm_client::{parse_json, GenerationRequest, Message, TextGenerator};

/// Keys the extraction model likes to echo back from the prompt header.
const EXCLUDED_ATTRIBUTES: &[&str] = &["Aktuelles_Datum", "Aktuelles Datum", "Datum", "Wochentag"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileAttribute {
    pub user_id: String,
    pub attribute_name: String,
    pub attribute_value: String,
    pub last_updated: DateTime<Utc>,
}

pub fn is_excluded_attribute(name: &str) -> bool {
    EXCLUDED_ATTRIBUTES
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(name.trim()))
}

/// Flatten a JSON value into the stored plain-text form.
/// Arrays are comma-joined, objects keep their JSON text, nulls yield nothing.
pub fn normalize_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(normalize_value)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

pub fn profile_map(attributes: &[ProfileAttribute]) -> BTreeMap<String, String> {
    attributes
        .iter()
        .map(|a| (a.attribute_name.clone(), a.attribute_value.clone()))
        .collect()
}

pub fn render_profile(attributes: &[ProfileAttribute]) -> String {
    if attributes.is_empty() {
        return "Keine Profilinformationen vorhanden.".to_string();
    }
    attributes
        .iter()
        .map(|a| format!("- {}: {}", a.attribute_name, a.attribute_value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Upsert new or changed attributes under their keys as given; returns how
/// many rows were written. Blank keys and empty values are skipped.
pub fn apply_profile_update(
    db: &CoachDatabase,
    user_id: &str,
    updates: &serde_json::Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let existing = profile_map(&db.list_profile(user_id)?);
    let mut written = 0;

    for (name, raw_value) in updates {
        if name.trim().is_empty() {
            continue;
        }
        let Some(value) = normalize_value(raw_value) else {
            continue;
        };
        if existing.get(name).map(|v| v == &value).unwrap_or(false) {
            continue;
        }
        db.upsert_profile_attribute(user_id, name, &value, now)
            .with_context(|| format!("Failed to store profile attribute '{}'", name))?;
        written += 1;
    }

    Ok(written)
}

/// The latest exchange handed to the extraction worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    pub user_id: String,
    pub user_input: String,
    pub ai_response: String,
    pub last_question: Option<String>,
}

pub struct ProfileExtractor {
    db: Arc<CoachDatabase>,
    generator: Arc<dyn TextGenerator>,
    model: String,
}

impl ProfileExtractor {
    pub fn new(db: Arc<CoachDatabase>, generator: Arc<dyn TextGenerator>, model: String) -> Self {
        Self {
            db,
            generator,
            model,
        }
    }

    /// Ask the model for the complete updated attribute set and store the
    /// differences. Unparseable output is logged and skipped.
    pub async fn extract(&self, job: &ExtractionJob, now: DateTime<Utc>) -> Result<usize> {
        let existing = profile_map(&self.db.list_profile(&job.user_id)?);
        let prompt = build_extraction_prompt(&existing, job);

        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(
                    "Du extrahierst Profilinformationen aus Gesprächen und antwortest ausschließlich mit einem JSON-Objekt.",
                ),
                Message::user(prompt),
            ],
        )
        .temperature(0.3)
        .json();

        let raw = self.generator.generate(request).await?;
        let updates = match parse_json::<serde_json::Map<String, Value>>(&raw) {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(
                    "Profile extraction for {} returned unparseable output: {:#}",
                    job.user_id,
                    e
                );
                return Ok(0);
            }
        };

        let updates: serde_json::Map<String, Value> = updates
            .into_iter()
            .filter_map(|(name, value)| {
                let name = name.trim().to_string();
                (!name.is_empty() && !is_excluded_attribute(&name)).then_some((name, value))
            })
            .collect();

        let written = apply_profile_update(&self.db, &job.user_id, &updates, now)?;
        tracing::debug!(
            "Profile extraction for {} updated {} attribute(s)",
            job.user_id,
            written
        );
        Ok(written)
    }
}

fn build_extraction_prompt(existing: &BTreeMap<String, String>, job: &ExtractionJob) -> String {
    let existing_json =
        serde_json::to_string_pretty(existing).unwrap_or_else(|_| "{}".to_string());
    let question = job
        .last_question
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .unwrap_or("(keine)");

    format!(
        "## Bisheriges Profil\n{}\n\n\
         ## Letzte Einstiegsfrage\n{}\n\n\
         ## Letzter Austausch\nUser: {}\nBerater: {}\n\n\
         Aktualisiere das Profil mit allen neuen oder geänderten Fakten über den Nutzer \
         (z. B. Name, Beruf, Hobbys, Familie, Werte, Herausforderungen).\n\
         Gib das vollständige aktualisierte Profil als flaches JSON-Objekt zurück, \
         Schlüssel sind Attributnamen, Werte sind Strings.\n\
         Nimm kein Datum und keinen Wochentag auf.",
        existing_json, question, job.user_input, job.ai_response,
    )
}

/// Sending side of the background extraction worker.
#[derive(Clone)]
pub struct ExtractionQueue {
    tx: flume::Sender<ExtractionJob>,
}

impl ExtractionQueue {
    pub fn new() -> (Self, flume::Receiver<ExtractionJob>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Fire and forget; a closed worker is only logged.
    pub fn enqueue(&self, job: ExtractionJob) {
        if let Err(e) = self.tx.send(job) {
            tracing::warn!("Profile extraction worker unavailable: {}", e);
        }
    }

    /// Consume jobs until every sender is dropped.
    pub fn spawn_worker(
        extractor: ProfileExtractor,
        rx: flume::Receiver<ExtractionJob>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(job) = rx.recv_async().await {
                if let Err(e) = extractor.extract(&job, Utc::now()).await {
                    tracing::warn!("Profile extraction for {} failed: {:#}", job.user_id, e);
                }
            }
            tracing::info!("Profile extraction worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{shared_database, ScriptedGenerator};
    use chrono::TimeZone;
    use serde_json::json;

    fn job(user_id: &str) -> ExtractionJob {
        ExtractionJob {
            user_id: user_id.to_string(),
            user_input: "Ich heiße Anna und laufe gern.".to_string(),
            ai_response: "Schön, Anna!".to_string(),
            last_question: Some("Was machst du in deiner Freizeit?".to_string()),
        }
    }

    #[test]
    fn values_are_flattened_to_plain_text() {
        assert_eq!(
            normalize_value(&json!(["Laufen", "Kochen"])).as_deref(),
            Some("Laufen, Kochen")
        );
        assert_eq!(normalize_value(&json!(34)).as_deref(), Some("34"));
        assert_eq!(
            normalize_value(&json!({"Name": "Max"})).as_deref(),
            Some(r#"{"Name":"Max"}"#)
        );
        assert_eq!(normalize_value(&json!(null)), None);
        assert_eq!(normalize_value(&json!("  ")), None);
    }

    #[tokio::test]
    async fn extraction_round_trips_plain_strings_and_skips_denylist() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(ScriptedGenerator::new().then_ok(
            r#"{"Name": "Anna", "Hobbys": ["Laufen", "Lesen"], "Aktuelles_Datum": "01.01.2026", "Wochentag": "Montag", "": "x"}"#,
        ));
        let extractor = ProfileExtractor::new(db.clone(), generator.clone(), "gpt-4o".to_string());

        let written = extractor.extract(&job("u1"), Utc::now()).await.expect("extract");
        assert_eq!(written, 2);

        let profile = profile_map(&db.list_profile("u1").expect("profile"));
        assert_eq!(profile.get("Name").map(String::as_str), Some("Anna"));
        assert_eq!(profile.get("Hobbys").map(String::as_str), Some("Laufen, Lesen"));
        assert!(!profile.contains_key("Aktuelles_Datum"));
        assert!(!profile.contains_key("Wochentag"));

        let request = &generator.requests()[0];
        assert!(request.json_output);
        assert_eq!(request.temperature, Some(0.3));
        assert!(generator.prompt(0).contains("Was machst du in deiner Freizeit?"));
    }

    #[tokio::test]
    async fn unchanged_attributes_are_not_rewritten() {
        let (_dir, db) = shared_database();
        let first = Utc.with_ymd_and_hms(2026, 1, 5, 8, 30, 0).unwrap();
        db.upsert_profile_attribute("u1", "Name", "Anna", first)
            .expect("seed");

        let generator = Arc::new(ScriptedGenerator::always(r#"{"Name": "Anna", "Beruf": "Ärztin"}"#));
        let extractor = ProfileExtractor::new(db.clone(), generator, "gpt-4o".to_string());
        assert_eq!(extractor.extract(&job("u1"), Utc::now()).await.expect("extract"), 1);

        let attributes = db.list_profile("u1").expect("profile");
        let name = attributes
            .iter()
            .find(|a| a.attribute_name == "Name")
            .expect("name");
        assert_eq!(name.last_updated, first);
    }

    #[tokio::test]
    async fn unparseable_output_is_skipped() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(ScriptedGenerator::always("Ich konnte nichts finden."));
        let extractor = ProfileExtractor::new(db.clone(), generator, "gpt-4o".to_string());
        assert_eq!(extractor.extract(&job("u1"), Utc::now()).await.expect("extract"), 0);
        assert!(db.list_profile("u1").expect("profile").is_empty());
    }

    #[test]
    fn explicit_update_keeps_keys_verbatim() {
        let (_dir, db) = shared_database();
        let updates = json!({"Wochentag": "Montag", " Hobby ": "Schach", "  ": "leer", "Beruf": null});
        let written = apply_profile_update(
            &db,
            "u1",
            updates.as_object().expect("object"),
            Utc::now(),
        )
        .expect("update");
        assert_eq!(written, 2);

        let profile = profile_map(&db.list_profile("u1").expect("profile"));
        assert_eq!(profile.get("Wochentag").map(String::as_str), Some("Montag"));
        assert_eq!(profile.get(" Hobby ").map(String::as_str), Some("Schach"));
        assert_eq!(profile.len(), 2);
    }

    #[tokio::test]
    async fn worker_survives_reversed_braces() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(
            ScriptedGenerator::new()
                .then_ok("Keine neuen Fakten } gefunden {")
                .then_ok(r#"{"Name": "Anna"}"#),
        );
        let extractor = ProfileExtractor::new(db.clone(), generator, "gpt-4o".to_string());
        let (queue, rx) = ExtractionQueue::new();
        let handle = ExtractionQueue::spawn_worker(extractor, rx);

        queue.enqueue(job("u1"));
        queue.enqueue(job("u1"));
        drop(queue);
        handle.await.expect("worker exits cleanly");

        let profile = profile_map(&db.list_profile("u1").expect("profile"));
        assert_eq!(profile.get("Name").map(String::as_str), Some("Anna"));
    }

    #[test]
    fn queue_delivers_jobs_to_receiver() {
        let (queue, rx) = ExtractionQueue::new();
        queue.enqueue(job("u1"));
        assert_eq!(rx.try_recv().expect("job").user_id, "u1");
    }
}
