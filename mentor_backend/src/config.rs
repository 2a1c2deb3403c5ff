use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_chat_model")]
    pub chat: String,
    #[serde(default = "default_extraction_model")]
    pub extraction: String,
    #[serde(default = "default_question_model")]
    pub question: String,
    #[serde(default = "default_review_model")]
    pub review: String,
    #[serde(default = "default_summary_model")]
    pub summary: String,
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_extraction_model() -> String {
    "gpt-4o".to_string()
}

fn default_question_model() -> String {
    "gpt-4".to_string()
}

fn default_review_model() -> String {
    "gpt-4".to_string()
}

fn default_summary_model() -> String {
    "gpt-3.5-turbo".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            chat: default_chat_model(),
            extraction: default_extraction_model(),
            question: default_question_model(),
            review: default_review_model(),
            summary: default_summary_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentorConfig {
    // LLM configuration (OpenAI-compatible: OpenAI, Ollama, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub models: ModelConfig,

    // Storage and HTTP surface
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Chat context
    #[serde(default = "default_chat_history_limit")]
    pub chat_history_limit: usize,
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
    #[serde(default = "default_memory_excerpt_limit")]
    pub memory_excerpt_limit: usize,

    // Entry questions
    #[serde(default = "default_entry_history_limit")]
    pub entry_history_limit: usize,
    #[serde(default = "default_avoid_question_count")]
    pub avoid_question_count: usize,
    #[serde(default = "default_universe_probability")]
    pub universe_persona_probability: f64,

    // Reviews
    #[serde(default = "default_review_recent_threshold")]
    pub review_recent_threshold: usize,
    /// Minutes between scheduled review sweeps. 0 disables the scheduler.
    #[serde(default)]
    pub review_interval_mins: u64,

    #[serde(default = "default_todo_archive_after_days")]
    pub todo_archive_after_days: i64,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_database_path() -> String {
    "mentor.db".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_chat_history_limit() -> usize {
    5
}

fn default_history_token_budget() -> usize {
    1200
}

fn default_memory_excerpt_limit() -> usize {
    10
}

fn default_entry_history_limit() -> usize {
    30
}

fn default_avoid_question_count() -> usize {
    8
}

fn default_universe_probability() -> f64 {
    0.05
}

fn default_review_recent_threshold() -> usize {
    10
}

fn default_todo_archive_after_days() -> i64 {
    30
}

impl Default for MentorConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            models: ModelConfig::default(),
            database_path: default_database_path(),
            bind_addr: default_bind_addr(),
            chat_history_limit: default_chat_history_limit(),
            history_token_budget: default_history_token_budget(),
            memory_excerpt_limit: default_memory_excerpt_limit(),
            entry_history_limit: default_entry_history_limit(),
            avoid_question_count: default_avoid_question_count(),
            universe_persona_probability: default_universe_probability(),
            review_recent_threshold: default_review_recent_threshold(),
            review_interval_mins: 0,
            todo_archive_after_days: default_todo_archive_after_days(),
        }
    }
}

impl MentorConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to `mentor_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("mentor_config.toml")
    }

    /// Load config from mentor_config.toml, falling back to defaults + env vars.
    /// Environment overrides are applied on top of the file in both cases.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<MentorConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };

        let base = base.unwrap_or_else(|| {
            tracing::warn!("No config file found, using defaults + env vars");
            Self::default()
        });
        base.with_env_overrides(|key| env::var(key).ok())
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = non_empty("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(key) = non_empty("LLM_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.llm_api_key = Some(key);
        }

        if let Some(model) = non_empty("LLM_CHAT_MODEL") {
            self.models.chat = model;
        }

        if let Some(model) = non_empty("LLM_EXTRACTION_MODEL") {
            self.models.extraction = model;
        }

        if let Some(model) = non_empty("LLM_QUESTION_MODEL") {
            self.models.question = model;
        }

        if let Some(model) = non_empty("LLM_REVIEW_MODEL") {
            self.models.review = model;
        }

        if let Some(model) = non_empty("LLM_SUMMARY_MODEL") {
            self.models.summary = model;
        }

        if let Some(path) = non_empty("MENTOR_DATABASE_PATH") {
            self.database_path = path;
        }

        if let Some(bind) = non_empty("MENTOR_BACKEND_BIND") {
            self.bind_addr = bind;
        }

        if let Some(limit) = non_empty("MENTOR_CHAT_HISTORY_LIMIT") {
            if let Ok(limit) = limit.parse() {
                self.chat_history_limit = limit;
            }
        }

        if let Some(budget) = non_empty("MENTOR_HISTORY_TOKEN_BUDGET") {
            if let Ok(budget) = budget.parse() {
                self.history_token_budget = budget;
            }
        }

        if let Some(probability) = non_empty("MENTOR_UNIVERSE_PROBABILITY") {
            if let Ok(probability) = probability.parse::<f64>() {
                self.universe_persona_probability = probability.clamp(0.0, 1.0);
            }
        }

        if let Some(interval) = non_empty("MENTOR_REVIEW_INTERVAL_MINS") {
            if let Ok(minutes) = interval.parse() {
                self.review_interval_mins = minutes;
            }
        }

        if let Some(days) = non_empty("MENTOR_TODO_ARCHIVE_AFTER_DAYS") {
            if let Ok(days) = days.parse() {
                self.todo_archive_after_days = days;
            }
        }

        self
    }
}
