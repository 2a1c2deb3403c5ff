use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::conversation::{ConversationEntry, EntryKind};
use crate::goals::{Goal, NewGoal};
use crate::profile::ProfileAttribute;
use crate::reports::MemoryEntry;
use crate::routines::Routine;
use crate::todos::{Priority, RecurrenceType, Todo, TodoFilter, TodoStatus};

/// Canonical timestamp encoding: RFC 3339, UTC, microseconds, `Z` suffix.
/// Every stored timestamp uses it so range filters can compare strings.
pub fn db_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn db_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn conversion_error(
    idx: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(error))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.filter(|v| !v.trim().is_empty())
        .map(|v| v.parse::<DateTime<Utc>>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn optional_date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<NaiveDate>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// The persistence collaborator: one SQLite connection shared by all requests.
pub struct CoachDatabase {
    conn: Mutex<Connection>,
}

impl CoachDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database {:?}", path.as_ref()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|name| name == column))
    }

    /// Older conversation tables carry no kind column; rows stay NULL and are
    /// classified on read.
    fn ensure_conversation_kind_column(&self, conn: &Connection) -> Result<()> {
        if !Self::table_has_column(conn, "conversation_history", "kind")? {
            conn.execute("ALTER TABLE conversation_history ADD COLUMN kind TEXT", [])?;
        }
        Ok(())
    }

    fn ensure_routine_tracking_columns(&self, conn: &Connection) -> Result<()> {
        if !Self::table_has_column(conn, "routines", "last_checked_date")? {
            conn.execute("ALTER TABLE routines ADD COLUMN last_checked_date TEXT", [])?;
        }
        if !Self::table_has_column(conn, "routines", "missed_dates")? {
            conn.execute(
                "ALTER TABLE routines ADD COLUMN missed_dates TEXT NOT NULL DEFAULT '[]'",
                [],
            )?;
        }
        Ok(())
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS profile (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                attribute_name TEXT NOT NULL,
                attribute_value TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                UNIQUE(user_id, attribute_name)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversation_history (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT,
                user_input TEXT,
                ai_response TEXT,
                ai_prompt TEXT,
                timestamp TEXT NOT NULL
            )"#,
            [],
        )?;
        self.ensure_conversation_kind_column(&conn)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversation_user_ts ON conversation_history(user_id, timestamp DESC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS goals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                titel TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'offen',
                deadline TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS routines (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                task TEXT NOT NULL,
                day TEXT NOT NULL,
                time TEXT NOT NULL DEFAULT '',
                checked INTEGER NOT NULL DEFAULT 0,
                last_checked_date TEXT,
                missed_count INTEGER NOT NULL DEFAULT 0,
                missed_dates TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;
        self.ensure_routine_tracking_columns(&conn)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_routines_user_day ON routines(user_id, day)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS long_term_memory (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                thema TEXT NOT NULL,
                inhalt TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_user_thema_ts ON long_term_memory(user_id, thema, timestamp DESC)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS todos (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                priority TEXT NOT NULL DEFAULT 'medium',
                due_date TEXT,
                category TEXT NOT NULL DEFAULT 'allgemein',
                status TEXT NOT NULL DEFAULT 'open',
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                recurrence_type TEXT,
                recurrence_day TEXT,
                parent_todo_id TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_todos_user_status ON todos(user_id, status)",
            [],
        )?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    // ========================================================================
    // Profile (EAV attributes)
    // ========================================================================

    pub fn list_profile(&self, user_id: &str) -> Result<Vec<ProfileAttribute>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, attribute_name, attribute_value, last_updated
             FROM profile
             WHERE user_id = ?1
             ORDER BY attribute_name ASC",
        )?;

        let attributes = stmt
            .query_map([user_id], |row| {
                Ok(ProfileAttribute {
                    user_id: row.get(0)?,
                    attribute_name: row.get(1)?,
                    attribute_value: row.get(2)?,
                    last_updated: timestamp_at(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(attributes)
    }

    pub fn upsert_profile_attribute(
        &self,
        user_id: &str,
        name: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO profile (user_id, attribute_name, attribute_value, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, attribute_name) DO UPDATE SET
                attribute_value = excluded.attribute_value,
                last_updated = excluded.last_updated",
            params![user_id, name, value, db_timestamp(now)],
        )?;
        Ok(())
    }

    // ========================================================================
    // Conversation log
    // ========================================================================

    pub fn insert_conversation_entry(&self, entry: &ConversationEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversation_history (id, user_id, kind, user_input, ai_response, ai_prompt, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.user_id,
                entry.kind.as_db_str(),
                entry.user_input,
                entry.ai_response,
                entry.ai_prompt,
                db_timestamp(entry.timestamp),
            ],
        )?;
        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ConversationEntry> {
        let kind_raw: Option<String> = row.get(2)?;
        let user_input: Option<String> = row.get(3)?;
        let ai_prompt: Option<String> = row.get(5)?;
        let kind = kind_raw
            .as_deref()
            .and_then(EntryKind::from_db)
            .unwrap_or_else(|| EntryKind::infer_legacy(user_input.as_deref(), ai_prompt.as_deref()));

        Ok(ConversationEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind,
            user_input,
            ai_response: row.get(4)?,
            ai_prompt,
            timestamp: timestamp_at(row, 6)?,
        })
    }

    /// Newest `limit` entries for a user, returned in chronological order.
    pub fn recent_conversation_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, user_input, ai_response, ai_prompt, timestamp
             FROM conversation_history
             WHERE user_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(params![user_id, limit], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        Ok(entries.into_iter().rev().collect())
    }

    /// Entries with `timestamp >= since`, oldest first.
    pub fn conversation_entries_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConversationEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, user_input, ai_response, ai_prompt, timestamp
             FROM conversation_history
             WHERE user_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC",
        )?;

        let entries = stmt
            .query_map(params![user_id, db_timestamp(since)], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Most recent assistant-initiated questions, newest first.
    pub fn recent_assistant_questions(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
        let entries = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, user_input, ai_response, ai_prompt, timestamp
                 FROM conversation_history
                 WHERE user_id = ?1
                   AND ai_prompt IS NOT NULL AND TRIM(ai_prompt) != ''
                 ORDER BY timestamp DESC",
            )?;
            let rows = stmt
                .query_map([user_id], Self::row_to_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok(entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::AssistantQuestion)
            .filter_map(|e| e.ai_prompt)
            .take(limit)
            .collect())
    }

    pub fn count_conversation_entries(&self, user_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM conversation_history WHERE user_id = ?1",
            [user_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Every user that has talked to the service.
    pub fn conversation_user_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT user_id FROM conversation_history ORDER BY user_id ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ========================================================================
    // Goals
    // ========================================================================

    fn row_to_goal(row: &Row<'_>) -> rusqlite::Result<Goal> {
        Ok(Goal {
            id: row.get(0)?,
            user_id: row.get(1)?,
            titel: row.get(2)?,
            status: row.get(3)?,
            deadline: row.get(4)?,
            created_at: timestamp_at(row, 5)?,
        })
    }

    pub fn insert_goal(&self, user_id: &str, goal: &NewGoal, now: DateTime<Utc>) -> Result<Goal> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO goals (user_id, titel, status, deadline, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, goal.titel, goal.status, goal.deadline, db_timestamp(now)],
        )?;
        Ok(Goal {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            titel: goal.titel.clone(),
            status: goal.status.clone(),
            deadline: goal.deadline.clone(),
            created_at: now,
        })
    }

    pub fn list_goals(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<Goal>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, titel, status, deadline, created_at
             FROM goals
             WHERE user_id = ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let goals = stmt
            .query_map(params![user_id, limit], Self::row_to_goal)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn list_goals_with_status(&self, user_id: &str, status: &str) -> Result<Vec<Goal>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, titel, status, deadline, created_at
             FROM goals
             WHERE user_id = ?1 AND status = ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let goals = stmt
            .query_map(params![user_id, status], Self::row_to_goal)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn goals_created_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Goal>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, titel, status, deadline, created_at
             FROM goals
             WHERE user_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let goals = stmt
            .query_map(params![user_id, db_timestamp(since)], Self::row_to_goal)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    /// Returns false when no goal with that id belongs to the user.
    pub fn update_goal_status(&self, user_id: &str, goal_id: i64, status: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE goals SET status = ?3 WHERE id = ?1 AND user_id = ?2",
            params![goal_id, user_id, status],
        )?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Routines
    // ========================================================================

    fn row_to_routine(row: &Row<'_>) -> rusqlite::Result<Routine> {
        let missed_raw: Option<String> = row.get(8)?;
        let missed_dates = match missed_raw.as_deref().map(str::trim) {
            None | Some("") => Vec::new(),
            Some(raw) => {
                serde_json::from_str::<Vec<NaiveDate>>(raw).map_err(|e| conversion_error(8, e))?
            }
        };

        Ok(Routine {
            id: row.get(0)?,
            user_id: row.get(1)?,
            task: row.get(2)?,
            day: row.get(3)?,
            time: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            checked: row.get::<_, i64>(5)? != 0,
            last_checked_date: optional_date_at(row, 6)?,
            missed_count: row.get(7)?,
            missed_dates,
            created_at: timestamp_at(row, 9)?,
        })
    }

    const ROUTINE_COLUMNS: &'static str = "id, user_id, task, day, time, checked, last_checked_date, missed_count, missed_dates, created_at";

    pub fn insert_routine(&self, routine: &Routine) -> Result<()> {
        let missed_json = serde_json::to_string(&routine.missed_dates)
            .context("Failed to serialize missed dates")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO routines (id, user_id, task, day, time, checked, last_checked_date, missed_count, missed_dates, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                routine.id,
                routine.user_id,
                routine.task,
                routine.day,
                routine.time,
                routine.checked as i64,
                routine.last_checked_date.map(db_date),
                routine.missed_count,
                missed_json,
                db_timestamp(routine.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_routine(&self, user_id: &str, routine_id: &str) -> Result<Option<Routine>> {
        let conn = self.lock_conn()?;
        let routine = conn
            .query_row(
                &format!(
                    "SELECT {} FROM routines WHERE id = ?1 AND user_id = ?2",
                    Self::ROUTINE_COLUMNS
                ),
                params![routine_id, user_id],
                Self::row_to_routine,
            )
            .optional()?;
        Ok(routine)
    }

    pub fn list_routines(&self, user_id: &str) -> Result<Vec<Routine>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routines WHERE user_id = ?1 ORDER BY created_at ASC",
            Self::ROUTINE_COLUMNS
        ))?;
        let routines = stmt
            .query_map([user_id], Self::row_to_routine)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(routines)
    }

    pub fn list_routines_for_day(&self, user_id: &str, day: &str) -> Result<Vec<Routine>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routines WHERE user_id = ?1 AND day = ?2 ORDER BY time ASC, created_at ASC",
            Self::ROUTINE_COLUMNS
        ))?;
        let routines = stmt
            .query_map(params![user_id, day], Self::row_to_routine)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(routines)
    }

    /// Clear the checked flag and re-anchor it to `date`.
    pub fn reset_routine(&self, routine_id: &str, date: NaiveDate) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE routines SET checked = 0, last_checked_date = ?2 WHERE id = ?1",
            params![routine_id, db_date(date)],
        )?;
        Ok(())
    }

    pub fn set_routine_checked(
        &self,
        user_id: &str,
        routine_id: &str,
        checked: bool,
        date: NaiveDate,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE routines SET checked = ?3, last_checked_date = ?4 WHERE id = ?1 AND user_id = ?2",
            params![routine_id, user_id, checked as i64, db_date(date)],
        )?;
        Ok(changed > 0)
    }

    pub fn set_routine_misses(
        &self,
        routine_id: &str,
        missed_dates: &[NaiveDate],
        missed_count: i64,
    ) -> Result<()> {
        let missed_json =
            serde_json::to_string(missed_dates).context("Failed to serialize missed dates")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE routines SET missed_dates = ?2, missed_count = ?3 WHERE id = ?1",
            params![routine_id, missed_json, missed_count],
        )?;
        Ok(())
    }

    pub fn delete_routine(&self, user_id: &str, routine_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "DELETE FROM routines WHERE id = ?1 AND user_id = ?2",
            params![routine_id, user_id],
        )?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Long-term memory (insights and periodic reviews)
    // ========================================================================

    fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
        Ok(MemoryEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            thema: row.get(2)?,
            inhalt: row.get(3)?,
            timestamp: timestamp_at(row, 4)?,
        })
    }

    pub fn insert_memory_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO long_term_memory (id, user_id, thema, inhalt, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.user_id,
                entry.thema,
                entry.inhalt,
                db_timestamp(entry.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Newest entries of any topic.
    pub fn recent_memory_entries(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, thema, inhalt, timestamp
             FROM long_term_memory
             WHERE user_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![user_id, limit], Self::row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Newest entries for one topic label.
    pub fn memory_entries_for_topic(
        &self,
        user_id: &str,
        thema: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, thema, inhalt, timestamp
             FROM long_term_memory
             WHERE user_id = ?1 AND thema = ?2
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(params![user_id, thema, limit], Self::row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn latest_memory_for_topic(&self, user_id: &str, thema: &str) -> Result<Option<MemoryEntry>> {
        Ok(self
            .memory_entries_for_topic(user_id, thema, 1)?
            .into_iter()
            .next())
    }

    /// Whether an entry with this topic exists in `[start, end)`.
    pub fn memory_exists_between(
        &self,
        user_id: &str,
        thema: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM long_term_memory
             WHERE user_id = ?1 AND thema = ?2 AND timestamp >= ?3 AND timestamp < ?4",
            params![user_id, thema, db_timestamp(start), db_timestamp(end)],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // To-dos
    // ========================================================================

    const TODO_COLUMNS: &'static str = "id, user_id, title, description, priority, due_date, category, status, completed, completed_at, is_recurring, recurrence_type, recurrence_day, parent_todo_id, created_at";

    fn row_to_todo(row: &Row<'_>) -> rusqlite::Result<Todo> {
        let recurrence_raw: Option<String> = row.get(11)?;
        Ok(Todo {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            priority: Priority::from_db(&row.get::<_, String>(4)?),
            due_date: optional_date_at(row, 5)?,
            category: row.get(6)?,
            status: TodoStatus::from_db(&row.get::<_, String>(7)?),
            completed: row.get::<_, i64>(8)? != 0,
            completed_at: optional_timestamp_at(row, 9)?,
            is_recurring: row.get::<_, i64>(10)? != 0,
            recurrence_type: recurrence_raw.as_deref().and_then(RecurrenceType::from_db),
            recurrence_day: row.get(12)?,
            parent_todo_id: row.get(13)?,
            created_at: timestamp_at(row, 14)?,
        })
    }

    fn write_todo(conn: &Connection, todo: &Todo, sql: &str) -> Result<usize> {
        let changed = conn.execute(
            sql,
            params![
                todo.id,
                todo.user_id,
                todo.title,
                todo.description,
                todo.priority.as_db_str(),
                todo.due_date.map(db_date),
                todo.category,
                todo.status.as_db_str(),
                todo.completed as i64,
                todo.completed_at.map(db_timestamp),
                todo.is_recurring as i64,
                todo.recurrence_type.map(|r| r.as_db_str()),
                todo.recurrence_day,
                todo.parent_todo_id,
                db_timestamp(todo.created_at),
            ],
        )?;
        Ok(changed)
    }

    pub fn insert_todo(&self, todo: &Todo) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::write_todo(
            &conn,
            todo,
            "INSERT INTO todos (id, user_id, title, description, priority, due_date, category, status, completed, completed_at, is_recurring, recurrence_type, recurrence_day, parent_todo_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        Ok(())
    }

    /// Overwrite every mutable column of an existing row.
    pub fn update_todo(&self, todo: &Todo) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = Self::write_todo(
            &conn,
            todo,
            "UPDATE todos SET
                title = ?3, description = ?4, priority = ?5, due_date = ?6, category = ?7,
                status = ?8, completed = ?9, completed_at = ?10, is_recurring = ?11,
                recurrence_type = ?12, recurrence_day = ?13, parent_todo_id = ?14, created_at = ?15
             WHERE id = ?1 AND user_id = ?2",
        )?;
        Ok(changed > 0)
    }

    pub fn get_todo(&self, user_id: &str, todo_id: &str) -> Result<Option<Todo>> {
        let conn = self.lock_conn()?;
        let todo = conn
            .query_row(
                &format!(
                    "SELECT {} FROM todos WHERE id = ?1 AND user_id = ?2",
                    Self::TODO_COLUMNS
                ),
                params![todo_id, user_id],
                Self::row_to_todo,
            )
            .optional()?;
        Ok(todo)
    }

    pub fn list_todos(&self, user_id: &str, filter: &TodoFilter) -> Result<Vec<Todo>> {
        let mut conditions = vec!["user_id = ?1".to_string()];
        let mut values: Vec<String> = vec![user_id.to_string()];

        if let Some(status) = filter.status {
            values.push(status.as_db_str().to_string());
            conditions.push(format!("status = ?{}", values.len()));
        } else if !filter.include_archived {
            conditions.push(format!("status != '{}'", TodoStatus::Archived.as_db_str()));
        }
        if let Some(category) = filter.category.as_deref() {
            values.push(category.to_string());
            conditions.push(format!("category = ?{}", values.len()));
        }

        let sql = format!(
            "SELECT {} FROM todos WHERE {}
             ORDER BY completed ASC, due_date IS NULL, due_date ASC, created_at ASC",
            Self::TODO_COLUMNS,
            conditions.join(" AND ")
        );

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let todos = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), Self::row_to_todo)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(todos)
    }

    #[cfg(test)]
    pub(crate) fn count_todo_children(&self, parent_todo_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM todos WHERE parent_todo_id = ?1",
            [parent_todo_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn delete_todo(&self, user_id: &str, todo_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "DELETE FROM todos WHERE id = ?1 AND user_id = ?2",
            params![todo_id, user_id],
        )?;
        Ok(changed > 0)
    }

    /// Archive completed to-dos finished before `cutoff`; returns how many moved.
    pub fn archive_completed_before(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE todos SET status = ?3
             WHERE user_id = ?1 AND status = ?4 AND completed_at IS NOT NULL AND completed_at < ?2",
            params![
                user_id,
                db_timestamp(cutoff),
                TodoStatus::Archived.as_db_str(),
                TodoStatus::Completed.as_db_str(),
            ],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_database;
    use chrono::{Duration, TimeZone};

    #[test]
    fn timestamps_sort_lexically() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let later = earlier + Duration::microseconds(1);
        assert!(db_timestamp(earlier) < db_timestamp(later));
        assert!(db_timestamp(earlier).ends_with('Z'));
    }

    #[test]
    fn profile_upsert_keeps_one_row_per_attribute() {
        let (_dir, db) = temp_database();
        let now = Utc::now();
        db.upsert_profile_attribute("u1", "Beruf", "Lehrer", now).expect("insert");
        db.upsert_profile_attribute("u1", "Beruf", "Schulleiter", now).expect("update");
        db.upsert_profile_attribute("u2", "Beruf", "Koch", now).expect("other user");

        let profile = db.list_profile("u1").expect("list");
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[0].attribute_value, "Schulleiter");
    }

    #[test]
    fn legacy_conversation_rows_without_kind_are_classified() {
        let (_dir, db) = temp_database();
        {
            let conn = db.lock_conn().expect("conn");
            conn.execute(
                "INSERT INTO conversation_history (id, user_id, kind, user_input, ai_response, ai_prompt, timestamp)
                 VALUES ('a', 'u1', NULL, '', '', 'Wie geht es dir?', '2026-01-01T08:00:00.000000Z'),
                        ('b', 'u1', NULL, 'Gut', 'Schön', '', '2026-01-01T08:01:00.000000Z')",
                [],
            )
            .expect("legacy rows");
        }

        let entries = db.recent_conversation_entries("u1", 10).expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::AssistantQuestion);
        assert_eq!(entries[1].kind, EntryKind::UserReply);
        assert_eq!(
            db.recent_assistant_questions("u1", 8).expect("questions"),
            vec!["Wie geht es dir?".to_string()]
        );
    }

    #[test]
    fn memory_range_check_is_half_open() {
        let (_dir, db) = temp_database();
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        db.insert_memory_entry(&MemoryEntry::new("u1", "Monatsrückblick", "Bericht", end))
            .expect("insert");

        assert!(!db
            .memory_exists_between("u1", "Monatsrückblick", start, end)
            .expect("query"));
        assert!(db
            .memory_exists_between("u1", "Monatsrückblick", end, end + Duration::days(1))
            .expect("query"));
    }

    #[test]
    fn goal_status_update_is_scoped_to_user() {
        let (_dir, db) = temp_database();
        let goal = db
            .insert_goal("u1", &NewGoal::titled("Marathon laufen"), Utc::now())
            .expect("insert");
        assert!(!db.update_goal_status("u2", goal.id, "erreicht").expect("update"));
        assert!(db.update_goal_status("u1", goal.id, "erreicht").expect("update"));
        assert!(db.list_goals_with_status("u1", "offen").expect("list").is_empty());
    }
}
