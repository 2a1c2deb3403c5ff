use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};

use crate::config::ModelConfig;
use crate::conversation::{split_for_budget, transcript, ConversationEntry};
use crate::database::CoachDatabase;
use crate::goals::{render_goals, DEFAULT_GOAL_STATUS};
use crate::llm_client::{summarize, GenerationRequest, Message, TextGenerator};
use crate::profile::{render_profile, ExtractionJob, ExtractionQueue};
use crate::reports::{render_memory, ReportKind};
use crate::routines::{german_weekday, render_routines_for_chat, RoutineTracker};
use crate::todos::{detect_todo_intent, render_todos_for_chat, NewTodo, TodoTracker};

pub const CHAT_FAILURE_MESSAGE: &str =
    "Entschuldige, es gab ein Problem beim Verarbeiten deiner Anfrage. Bitte versuche es später noch einmal.";

#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub history_limit: usize,
    pub history_token_budget: usize,
    pub memory_limit: usize,
    pub todo_archive_after_days: i64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_limit: 5,
            history_token_budget: 1200,
            memory_limit: 10,
            todo_archive_after_days: 30,
        }
    }
}

/// Everything the system prompt is assembled from.
#[derive(Debug, Clone)]
struct ChatContext {
    history: String,
    profile: String,
    routines: String,
    todos: String,
    memory: String,
    weekly_report: String,
    monthly_report: String,
    goals: String,
    last_question: Option<String>,
}

pub struct ChatOrchestrator {
    db: Arc<CoachDatabase>,
    generator: Arc<dyn TextGenerator>,
    models: ModelConfig,
    extraction: ExtractionQueue,
    settings: ChatSettings,
}

impl ChatOrchestrator {
    pub fn new(
        db: Arc<CoachDatabase>,
        generator: Arc<dyn TextGenerator>,
        models: ModelConfig,
        extraction: ExtractionQueue,
        settings: ChatSettings,
    ) -> Self {
        Self {
            db,
            generator,
            models,
            extraction,
            settings,
        }
    }

    /// Answer one user message. Only a failed model call is an error;
    /// every other failure degrades the context and is logged.
    pub async fn handle_chat(&self, user_id: &str, message: &str, now: DateTime<Utc>) -> Result<String> {
        let message = message.trim();

        if let Some(reply) = self.try_capture_todo(user_id, message, now) {
            return Ok(reply);
        }

        let context = self.assemble_context(user_id, now).await;
        let system = build_system_prompt(&context, now);
        tracing::debug!("Chat prompt for {}: {} chars", user_id, system.len());

        let request = GenerationRequest::new(
            self.models.chat.clone(),
            vec![Message::system(system), Message::user(message)],
        )
        .max_tokens(500)
        .temperature(0.7);

        let reply = self
            .generator
            .generate(request)
            .await
            .context("Chat generation failed")?;
        let reply = reply.trim().to_string();

        self.persist(&ConversationEntry::user_reply(user_id, message, &reply, now));
        self.extraction.enqueue(ExtractionJob {
            user_id: user_id.to_string(),
            user_input: message.to_string(),
            ai_response: reply.clone(),
            last_question: context.last_question,
        });

        Ok(reply)
    }

    fn try_capture_todo(&self, user_id: &str, message: &str, now: DateTime<Utc>) -> Option<String> {
        let title = detect_todo_intent(message)?;
        let tracker = TodoTracker::new(self.db.clone(), self.settings.todo_archive_after_days);
        match tracker.create(user_id, &NewTodo::titled(&title), now) {
            Ok(todo) => {
                let reply = format!(
                    "Alles klar, ich habe \"{}\" zu deinen To-Dos hinzugefügt.",
                    todo.title
                );
                self.persist(&ConversationEntry::user_reply(user_id, message, &reply, now));
                tracing::info!("Captured to-do {} from chat for {}", todo.id, user_id);
                Some(reply)
            }
            Err(e) => {
                tracing::warn!("To-do capture for {} failed, answering normally: {}", user_id, e);
                None
            }
        }
    }

    fn persist(&self, entry: &ConversationEntry) {
        if let Err(e) = self.db.insert_conversation_entry(entry) {
            tracing::warn!("Failed to store conversation entry for {}: {:#}", entry.user_id, e);
        }
    }

    async fn assemble_context(&self, user_id: &str, now: DateTime<Utc>) -> ChatContext {
        let today = now.date_naive();

        let entries = self
            .db
            .recent_conversation_entries(user_id, self.settings.history_limit)
            .unwrap_or_else(|e| {
                tracing::warn!("History unavailable for {}: {:#}", user_id, e);
                Vec::new()
            });
        let last_question = entries.iter().rev().find_map(|e| {
            e.ai_prompt
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
        });
        let history = self.budgeted_history(user_id, transcript(&entries)).await;

        let profile = match self.db.list_profile(user_id) {
            Ok(attributes) => render_profile(&attributes),
            Err(e) => {
                tracing::warn!("Profile unavailable for {}: {:#}", user_id, e);
                render_profile(&[])
            }
        };

        let routines = match RoutineTracker::new(self.db.clone()).list_routines(user_id, now) {
            Ok(views) => render_routines_for_chat(&views),
            Err(e) => {
                tracing::warn!("Routines unavailable for {}: {:#}", user_id, e);
                render_routines_for_chat(&[])
            }
        };

        let todos = match TodoTracker::new(self.db.clone(), self.settings.todo_archive_after_days)
            .active(user_id)
        {
            Ok(todos) => render_todos_for_chat(&todos, today),
            Err(e) => {
                tracing::warn!("To-dos unavailable for {}: {}", user_id, e);
                render_todos_for_chat(&[], today)
            }
        };

        let memory = match self.db.recent_memory_entries(user_id, self.settings.memory_limit) {
            Ok(entries) => render_memory(&entries),
            Err(e) => {
                tracing::warn!("Long-term memory unavailable for {}: {:#}", user_id, e);
                render_memory(&[])
            }
        };

        let weekly_report = self.latest_report_text(user_id, ReportKind::Weekly);
        let monthly_report = self.latest_report_text(user_id, ReportKind::Monthly);

        let goals = match self.db.list_goals_with_status(user_id, DEFAULT_GOAL_STATUS) {
            Ok(goals) => render_goals(&goals),
            Err(e) => {
                tracing::warn!("Goals unavailable for {}: {:#}", user_id, e);
                render_goals(&[])
            }
        };

        ChatContext {
            history,
            profile,
            routines,
            todos,
            memory,
            weekly_report,
            monthly_report,
            goals,
            last_question,
        }
    }

    fn latest_report_text(&self, user_id: &str, kind: ReportKind) -> String {
        match self.db.latest_memory_for_topic(user_id, kind.label()) {
            Ok(Some(entry)) => entry.inhalt,
            Ok(None) => format!("Kein {} verfügbar.", kind.label()),
            Err(e) => {
                tracing::warn!("{} unavailable for {}: {:#}", kind.label(), user_id, e);
                format!("Kein {} verfügbar.", kind.label())
            }
        }
    }

    /// Keep the newest lines within the token budget and replace the rest by
    /// one summary line. A failed summary just drops the older lines.
    async fn budgeted_history(&self, user_id: &str, lines: Vec<String>) -> String {
        if lines.is_empty() {
            return "Bisher keine frühere Konversationshistorie.".to_string();
        }

        let (older, kept) = split_for_budget(lines, self.settings.history_token_budget);
        let mut rendered = Vec::with_capacity(kept.len() + 1);
        if !older.is_empty() {
            match summarize(
                self.generator.as_ref(),
                &self.models.summary,
                &older.join("\n"),
                100,
                "wichtigsten Themen und offenen Punkte",
            )
            .await
            {
                Ok(summary) if !summary.is_empty() => {
                    rendered.push(format!("Zusammenfassung früherer Nachrichten: {}", summary))
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    "History summary for {} failed, dropping {} older line(s): {:#}",
                    user_id,
                    older.len(),
                    e
                ),
            }
        }
        rendered.extend(kept);
        rendered.join("\n")
    }
}

fn build_system_prompt(context: &ChatContext, now: DateTime<Utc>) -> String {
    format!(
        "Du bist ein persönlicher, anspruchsvoller und konstruktiver Mentor. \
         Dein Ziel ist es, dem Nutzer realistisch, prägnant und umsetzbar zu helfen.\n\n\
         Heutiges Datum: {}\n\
         Aktueller Wochentag: {}\n\n\
         ## Nutzerprofil\n{}\n\n\
         ## Routinen\n{}\n\n\
         ## To-Dos\n{}\n\n\
         ## Langzeitgedächtnis\n{}\n\n\
         ## Aktueller Wochenbericht\n{}\n\n\
         ## Aktueller Monatsbericht\n{}\n\n\
         ## Offene Ziele\n{}\n\n\
         ## Konversationshistorie\n{}\n\n\
         Analysiere die aktuelle Nachricht im Kontext aller Informationen. \
         Erkenne Inkonsistenzen oder mangelnden Fortschritt. Kein allgemeines Lob.\n\
         Stelle konkrete Fragen, schlage Aktionen vor oder rege Reflexion an.\n\
         Antworte mit höchstens drei Sätzen, knapp, direkt und auf konkrete nächste Schritte ausgerichtet.",
        now.format("%d.%m.%Y"),
        german_weekday(now.weekday()),
        context.profile,
        context.routines,
        context.todos,
        context.memory,
        context.weekly_report,
        context.monthly_report,
        context.goals,
        context.history,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::EntryKind;
    use crate::goals::NewGoal;
    use crate::testing::{shared_database, ScriptedGenerator};
    use crate::todos::TodoFilter;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, 19, 30, 0).unwrap()
    }

    fn orchestrator(
        db: Arc<CoachDatabase>,
        generator: Arc<ScriptedGenerator>,
        settings: ChatSettings,
    ) -> (ChatOrchestrator, flume::Receiver<ExtractionJob>) {
        let (queue, rx) = ExtractionQueue::new();
        (
            ChatOrchestrator::new(db, generator, ModelConfig::default(), queue, settings),
            rx,
        )
    }

    #[tokio::test]
    async fn reply_is_persisted_and_extraction_enqueued() {
        let (_dir, db) = shared_database();
        db.insert_conversation_entry(&ConversationEntry::assistant_question(
            "u1",
            "Wie schläfst du?",
            now() - Duration::minutes(5),
        ))
        .expect("question");
        db.upsert_profile_attribute("u1", "Beruf", "Lehrerin", now())
            .expect("profile");
        db.insert_goal("u1", &NewGoal::titled("Früher schlafen"), now())
            .expect("goal");

        let generator = Arc::new(ScriptedGenerator::always(" Was hält dich wach? "));
        let (chat, rx) = orchestrator(db.clone(), generator.clone(), ChatSettings::default());

        let reply = chat
            .handle_chat("u1", "Ich schlafe schlecht.", now())
            .await
            .expect("reply");
        assert_eq!(reply, "Was hält dich wach?");

        let system = &generator.requests()[0].messages[0].content;
        assert!(system.contains("Heutiges Datum: 11.03.2026"));
        assert!(system.contains("Aktueller Wochentag: Mittwoch"));
        assert!(system.contains("- Beruf: Lehrerin"));
        assert!(system.contains("- Früher schlafen (offen)"));
        assert!(system.contains("Interviewfrage: Wie schläfst du?"));
        assert_eq!(generator.requests()[0].max_tokens, Some(500));

        let entries = db.recent_conversation_entries("u1", 5).expect("entries");
        let last = entries.last().expect("reply entry");
        assert_eq!(last.kind, EntryKind::UserReply);
        assert_eq!(last.user_input.as_deref(), Some("Ich schlafe schlecht."));
        assert_eq!(last.ai_prompt, None);

        let job = rx.try_recv().expect("extraction job");
        assert_eq!(job.last_question.as_deref(), Some("Wie schläfst du?"));
        assert_eq!(job.ai_response, "Was hält dich wach?");
    }

    #[tokio::test]
    async fn todo_intent_short_circuits_the_model() {
        let (_dir, db) = shared_database();
        let generator = Arc::new(ScriptedGenerator::failing());
        let (chat, rx) = orchestrator(db.clone(), generator.clone(), ChatSettings::default());

        let reply = chat
            .handle_chat("u1", "Ich muss noch die Garage aufräumen", now())
            .await
            .expect("reply");
        assert_eq!(
            reply,
            "Alles klar, ich habe \"die Garage aufräumen\" zu deinen To-Dos hinzugefügt."
        );
        assert!(generator.requests().is_empty());
        assert!(rx.try_recv().is_err());

        let todos = db.list_todos("u1", &TodoFilter::default()).expect("todos");
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].category, "allgemein");
        assert_eq!(db.count_conversation_entries("u1").expect("count"), 1);
    }

    #[tokio::test]
    async fn model_failure_is_an_error_and_stores_nothing() {
        let (_dir, db) = shared_database();
        let (chat, rx) = orchestrator(db.clone(), Arc::new(ScriptedGenerator::failing()), ChatSettings::default());
        assert!(chat.handle_chat("u1", "Hallo", now()).await.is_err());
        assert_eq!(db.count_conversation_entries("u1").expect("count"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn over_budget_history_is_summarized() {
        let (_dir, db) = shared_database();
        for i in 0..3 {
            db.insert_conversation_entry(&ConversationEntry::user_reply(
                "u1",
                &format!("alte nachricht nummer {}", i),
                "ok",
                now() - Duration::minutes(10 - i),
            ))
            .expect("entry");
        }
        let generator = Arc::new(
            ScriptedGenerator::new()
                .then_ok("Es ging um alte Nachrichten.")
                .then_ok("Antwort"),
        );
        let settings = ChatSettings {
            history_token_budget: 7,
            ..ChatSettings::default()
        };
        let (chat, _rx) = orchestrator(db, generator.clone(), settings);
        chat.handle_chat("u1", "Neu", now()).await.expect("reply");

        assert_eq!(generator.requests()[0].model, "gpt-3.5-turbo");
        let system = &generator.requests()[1].messages[0].content;
        assert!(system.contains("Zusammenfassung früherer Nachrichten: Es ging um alte Nachrichten."));
        assert!(system.contains("User: alte nachricht nummer 2\nBerater: ok"));
        assert!(!system.contains("User: alte nachricht nummer 0"));
    }

    #[tokio::test]
    async fn failed_history_summary_drops_older_lines() {
        let (_dir, db) = shared_database();
        for i in 0..2 {
            db.insert_conversation_entry(&ConversationEntry::user_reply(
                "u1",
                &format!("eins zwei drei vier {}", i),
                "ok",
                now() - Duration::minutes(10 - i),
            ))
            .expect("entry");
        }
        let generator = Arc::new(ScriptedGenerator::new().then_err("down").then_ok("Antwort"));
        let settings = ChatSettings {
            history_token_budget: 8,
            ..ChatSettings::default()
        };
        let (chat, _rx) = orchestrator(db, generator.clone(), settings);
        assert_eq!(chat.handle_chat("u1", "Neu", now()).await.expect("reply"), "Antwort");

        let system = &generator.requests()[1].messages[0].content;
        assert!(!system.contains("Zusammenfassung früherer Nachrichten"));
        assert!(!system.contains("eins zwei drei vier 0"));
        assert!(system.contains("eins zwei drei vier 1"));
    }
}
