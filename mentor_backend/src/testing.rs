//! Test doubles shared by the unit tests of every module.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::database::CoachDatabase;
use crate::llm_client::{GenerationRequest, TextGenerator};

/// Open a fresh database inside a temp dir; keep the dir alive for the test.
pub fn temp_database() -> (tempfile::TempDir, CoachDatabase) {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = CoachDatabase::new(dir.path().join("mentor.db")).expect("open database");
    (dir, db)
}

pub fn shared_database() -> (tempfile::TempDir, Arc<CoachDatabase>) {
    let (dir, db) = temp_database();
    (dir, Arc::new(db))
}

/// Replays queued responses in order, then falls back to a fixed reply.
/// Every request is recorded for later assertions.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every unscripted request with `text`.
    pub fn always(text: &str) -> Self {
        Self {
            fallback: Some(text.to_string()),
            ..Self::default()
        }
    }

    /// Fail every unscripted request.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn then_ok(self, text: &str) -> Self {
        self.responses
            .lock()
            .expect("script lock")
            .push_back(Ok(text.to_string()));
        self
    }

    pub fn then_err(self, message: &str) -> Self {
        self.responses
            .lock()
            .expect("script lock")
            .push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("request lock").clone()
    }

    /// Concatenated message contents of the n-th request.
    pub fn prompt(&self, index: usize) -> String {
        self.requests()
            .get(index)
            .map(|r| {
                r.messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        self.requests.lock().expect("request lock").push(request);
        let next = self.responses.lock().expect("script lock").pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(anyhow::anyhow!("scripted generator exhausted")),
            },
        }
    }
}
