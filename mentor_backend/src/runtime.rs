use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::chat::{ChatOrchestrator, ChatSettings};
use crate::config::MentorConfig;
use crate::database::CoachDatabase;
use crate::llm_client::{LlmClient, TextGenerator};
use crate::profile::{ExtractionJob, ExtractionQueue, ProfileExtractor};
use crate::questions::{EntryQuestionGenerator, PersonaSelector, RandomPersonaSelector};
use crate::reports::ReviewGenerator;
use crate::routines::RoutineTracker;
use crate::scheduler::spawn_review_scheduler;
use crate::todos::TodoTracker;

/// Every service the HTTP layer needs, wired once at startup.
pub struct BackendRuntime {
    pub config: MentorConfig,
    pub db: Arc<CoachDatabase>,
    pub generator: Arc<dyn TextGenerator>,
    pub chat: Arc<ChatOrchestrator>,
    pub questions: Arc<EntryQuestionGenerator>,
    pub reviews: Arc<ReviewGenerator>,
    pub routines: Arc<RoutineTracker>,
    pub todos: Arc<TodoTracker>,
    extraction_rx: Option<flume::Receiver<ExtractionJob>>,
}

pub struct BackendRuntimeBuilder {
    config: MentorConfig,
    generator: Option<Arc<dyn TextGenerator>>,
    persona_selector: Option<Arc<dyn PersonaSelector>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: MentorConfig) -> Self {
        Self {
            config,
            generator: None,
            persona_selector: None,
        }
    }

    /// Replace the HTTP model client, e.g. with a local stub.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_persona_selector(mut self, selector: Arc<dyn PersonaSelector>) -> Self {
        self.persona_selector = Some(selector);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let db = Arc::new(
            CoachDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database at {}", config.database_path))?,
        );

        let generator = match self.generator {
            Some(generator) => generator,
            None => {
                if config.llm_api_key.is_none() {
                    tracing::warn!("No LLM API key configured; model calls will likely be rejected");
                }
                Arc::new(LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                )) as Arc<dyn TextGenerator>
            }
        };

        let selector = self.persona_selector.unwrap_or_else(|| {
            Arc::new(RandomPersonaSelector::new(config.universe_persona_probability))
        });

        let (extraction, extraction_rx) = ExtractionQueue::new();

        let chat = Arc::new(ChatOrchestrator::new(
            db.clone(),
            generator.clone(),
            config.models.clone(),
            extraction,
            ChatSettings {
                history_limit: config.chat_history_limit,
                history_token_budget: config.history_token_budget,
                memory_limit: config.memory_excerpt_limit,
                todo_archive_after_days: config.todo_archive_after_days,
            },
        ));
        let questions = Arc::new(EntryQuestionGenerator::new(
            db.clone(),
            generator.clone(),
            selector,
            config.models.question.clone(),
            config.entry_history_limit,
            config.avoid_question_count,
        ));
        let reviews = Arc::new(ReviewGenerator::new(
            db.clone(),
            generator.clone(),
            config.models.clone(),
            config.review_recent_threshold,
        ));
        let routines = Arc::new(RoutineTracker::new(db.clone()));
        let todos = Arc::new(TodoTracker::new(db.clone(), config.todo_archive_after_days));

        tracing::info!(
            "Backend runtime ready (database: {}, chat model: {})",
            config.database_path,
            config.models.chat
        );

        Ok(BackendRuntime {
            config,
            db,
            generator,
            chat,
            questions,
            reviews,
            routines,
            todos,
            extraction_rx: Some(extraction_rx),
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: MentorConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }

    /// Start the profile-extraction worker and the optional review tick.
    /// Must run inside a tokio runtime; a second call starts nothing new
    /// except another scheduler.
    pub fn spawn_background_tasks(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(rx) = self.extraction_rx.take() {
            let extractor = ProfileExtractor::new(
                self.db.clone(),
                self.generator.clone(),
                self.config.models.extraction.clone(),
            );
            handles.push(ExtractionQueue::spawn_worker(extractor, rx));
        }

        if let Some(handle) = spawn_review_scheduler(
            self.reviews.clone(),
            self.db.clone(),
            self.config.review_interval_mins,
        ) {
            handles.push(handle);
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questions::{FixedPersona, Persona, FIRST_QUESTION};
    use crate::testing::ScriptedGenerator;
    use chrono::Utc;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> MentorConfig {
        MentorConfig {
            database_path: dir.path().join("runtime.db").to_string_lossy().into_owned(),
            ..MentorConfig::default()
        }
    }

    #[tokio::test]
    async fn builder_wires_services_against_one_database() {
        let dir = tempfile::tempdir().expect("temp dir");
        let runtime = BackendRuntimeBuilder::new(test_config(&dir))
            .with_generator(Arc::new(ScriptedGenerator::failing()))
            .with_persona_selector(Arc::new(FixedPersona(Persona::CuriousFriend)))
            .build()
            .expect("runtime");

        let question = runtime
            .questions
            .start_interaction("anna", Utc::now())
            .await
            .expect("question");
        assert_eq!(question, FIRST_QUESTION);
        assert_eq!(runtime.db.count_conversation_entries("anna").expect("count"), 1);
    }

    #[tokio::test]
    async fn background_worker_applies_extracted_profile() {
        let dir = tempfile::tempdir().expect("temp dir");
        let generator = Arc::new(
            ScriptedGenerator::new()
                .then_ok("Gern geschehen.")
                .then_ok(r#"{"Name": "Anna"}"#),
        );
        let mut runtime = BackendRuntimeBuilder::new(test_config(&dir))
            .with_generator(generator)
            .build()
            .expect("runtime");
        let handles = runtime.spawn_background_tasks();
        assert_eq!(handles.len(), 1);

        runtime
            .chat
            .handle_chat("anna", "Ich heiße Anna.", Utc::now())
            .await
            .expect("reply");

        let mut profile = Vec::new();
        for _ in 0..50 {
            profile = runtime.db.list_profile("anna").expect("profile");
            if !profile.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[0].attribute_value, "Anna");
    }

    #[test]
    fn unopenable_database_fails_build() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = MentorConfig {
            database_path: dir
                .path()
                .join("missing")
                .join("nested")
                .join("db.sqlite")
                .to_string_lossy()
                .into_owned(),
            ..MentorConfig::default()
        };
        assert!(BackendRuntime::bootstrap(config).is_err());
    }
}
