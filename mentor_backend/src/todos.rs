use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::database::CoachDatabase;
use crate::reports::last_day_of_month;
use crate::routines::parse_weekday;

pub const DEFAULT_CATEGORY: &str = "allgemein";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            _ => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Open,
    InProgress,
    Completed,
    Archived,
}

impl TodoStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TodoStatus::Open => "open",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Archived => "archived",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_progress" => TodoStatus::InProgress,
            "completed" => TodoStatus::Completed,
            "archived" => TodoStatus::Archived,
            _ => TodoStatus::Open,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, TodoStatus::Open | TodoStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    Daily,
    Weekly,
    Monthly,
    /// First day of the month after completion.
    MonthlyFirst,
    Yearly,
}

impl RecurrenceType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            RecurrenceType::Daily => "daily",
            RecurrenceType::Weekly => "weekly",
            RecurrenceType::Monthly => "monthly",
            RecurrenceType::MonthlyFirst => "monthly_first",
            RecurrenceType::Yearly => "yearly",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(RecurrenceType::Daily),
            "weekly" => Some(RecurrenceType::Weekly),
            "monthly" => Some(RecurrenceType::Monthly),
            "monthly_first" => Some(RecurrenceType::MonthlyFirst),
            "yearly" => Some(RecurrenceType::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Todo {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
    pub category: String,
    pub status: TodoStatus,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub recurrence_type: Option<RecurrenceType>,
    pub recurrence_day: Option<String>,
    pub parent_todo_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Todo {
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status.is_active() && self.due_date.map(|d| d < today).unwrap_or(false)
    }
}

/// Body of `POST /todos/{user_id}`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NewTodo {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurrence_type: Option<RecurrenceType>,
    #[serde(default)]
    pub recurrence_day: Option<String>,
}

impl NewTodo {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }
}

/// Body of `PUT /todos/{user_id}/{todo_id}`; absent fields stay unchanged.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TodoUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub due_date: Option<NaiveDate>,
    pub category: Option<String>,
    pub status: Option<TodoStatus>,
    pub is_recurring: Option<bool>,
    pub recurrence_type: Option<RecurrenceType>,
    pub recurrence_day: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TodoFilter {
    pub status: Option<TodoStatus>,
    pub category: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TodoError {
    #[error("To-Do nicht gefunden")]
    NotFound,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub completed: Todo,
    pub spawned: Option<Todo>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TodoStats {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub archived: usize,
    pub overdue: usize,
    pub completed_last_7_days: usize,
    pub by_priority: BTreeMap<String, usize>,
}

/// Due date of the next instance of a recurring to-do.
pub fn next_due_date(
    recurrence: RecurrenceType,
    recurrence_day: Option<&str>,
    due_date: Option<NaiveDate>,
    completed_on: NaiveDate,
) -> NaiveDate {
    let base = due_date
        .filter(|due| *due >= completed_on)
        .unwrap_or(completed_on);

    match recurrence {
        RecurrenceType::Daily => base + Duration::days(1),
        RecurrenceType::Weekly => match recurrence_day.and_then(parse_weekday) {
            Some(day) => {
                let ahead = (day.num_days_from_monday() + 7 - base.weekday().num_days_from_monday()) % 7;
                base + Duration::days(if ahead == 0 { 7 } else { ahead as i64 })
            }
            None => base + Duration::days(7),
        },
        RecurrenceType::Monthly => base
            .checked_add_months(Months::new(1))
            .unwrap_or(last_day_of_month(base)),
        RecurrenceType::MonthlyFirst => last_day_of_month(completed_on) + Duration::days(1),
        RecurrenceType::Yearly => base
            .checked_add_months(Months::new(12))
            .unwrap_or(last_day_of_month(base)),
    }
}

/// Longest title accepted from an open-ended phrase like "ich muss noch X".
const MAX_OPEN_TITLE_WORDS: usize = 6;

/// Title of a to-do the user asked to note, if the message is such a request.
/// Open-ended phrases only count at the start of the message and for a short,
/// single-clause task.
pub fn detect_todo_intent(message: &str) -> Option<String> {
    let patterns = [
        (r"(?i)^\s*to-?do\s*:\s*(.+)$", false),
        (r"(?i)\bnotiere\s+(.+?)\s+als\s+aufgabe\b", false),
        (r"(?i)\bich\s+muss\s+(.+?)\s+erledigen\b", false),
        (r"(?i)^\s*erinnere\s+mich\s+an\s+(.+)$", true),
        (r"(?i)^\s*ich\s+muss\s+noch\s+(.+)$", true),
    ];

    for (pattern, open_ended) in &patterns {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if let Some(title) = re
                .captures(message.trim())
                .and_then(|caps| caps.get(1))
                .and_then(|m| clean_title(m.as_str()))
                .filter(|title| !open_ended || is_short_task(title))
            {
                return Some(title);
            }
        }
    }
    None
}

fn is_short_task(title: &str) -> bool {
    !title.contains([',', ';', ':']) && title.split_whitespace().count() <= MAX_OPEN_TITLE_WORDS
}

fn clean_title(raw: &str) -> Option<String> {
    let mut title = raw.trim().trim_end_matches(['.', '!', '?', ',']).trim();
    for prefix in ["noch ", "Noch "] {
        if let Some(rest) = title.strip_prefix(prefix) {
            title = rest.trim();
        }
    }
    (!title.is_empty()).then(|| title.to_string())
}

pub fn render_todos_for_chat(todos: &[Todo], today: NaiveDate) -> String {
    let active: Vec<&Todo> = todos.iter().filter(|t| t.status.is_active()).collect();
    if active.is_empty() {
        return "Keine offenen To-Dos.".to_string();
    }
    active
        .iter()
        .map(|t| {
            let due = match t.due_date {
                Some(d) if t.is_overdue(today) => format!(", ÜBERFÄLLIG seit {}", d.format("%d.%m.%Y")),
                Some(d) => format!(", fällig {}", d.format("%d.%m.%Y")),
                None => String::new(),
            };
            format!("- {} [{}{}]", t.title, t.priority.as_db_str(), due)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct TodoTracker {
    db: Arc<CoachDatabase>,
    archive_after_days: i64,
}

impl TodoTracker {
    pub fn new(db: Arc<CoachDatabase>, archive_after_days: i64) -> Self {
        Self {
            db,
            archive_after_days,
        }
    }

    pub fn create(&self, user_id: &str, new_todo: &NewTodo, now: DateTime<Utc>) -> Result<Todo, TodoError> {
        let title = new_todo.title.trim();
        if title.is_empty() {
            return Err(TodoError::Invalid("Titel darf nicht leer sein".to_string()));
        }
        validate_recurrence(
            new_todo.is_recurring,
            new_todo.recurrence_type,
            new_todo.recurrence_day.as_deref(),
        )?;

        let category = new_todo
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CATEGORY);

        let todo = Todo {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            description: new_todo.description.trim().to_string(),
            priority: new_todo.priority,
            due_date: new_todo.due_date,
            category: category.to_string(),
            status: TodoStatus::Open,
            completed: false,
            completed_at: None,
            is_recurring: new_todo.is_recurring,
            recurrence_type: new_todo.recurrence_type.filter(|_| new_todo.is_recurring),
            recurrence_day: new_todo.recurrence_day.clone().filter(|_| new_todo.is_recurring),
            parent_todo_id: None,
            created_at: now,
        };
        self.db.insert_todo(&todo)?;
        tracing::debug!("Created to-do {} for {}", todo.id, user_id);
        Ok(todo)
    }

    pub fn list(&self, user_id: &str, filter: &TodoFilter) -> Result<Vec<Todo>, TodoError> {
        Ok(self.db.list_todos(user_id, filter)?)
    }

    pub fn get(&self, user_id: &str, todo_id: &str) -> Result<Todo, TodoError> {
        self.db.get_todo(user_id, todo_id)?.ok_or(TodoError::NotFound)
    }

    /// Apply a partial update. Moving to `completed` goes through `complete`
    /// so recurring to-dos still spawn their next instance.
    pub fn update(
        &self,
        user_id: &str,
        todo_id: &str,
        update: &TodoUpdate,
        now: DateTime<Utc>,
    ) -> Result<Todo, TodoError> {
        let mut todo = self.get(user_id, todo_id)?;

        if let Some(title) = update.title.as_deref() {
            let title = title.trim();
            if title.is_empty() {
                return Err(TodoError::Invalid("Titel darf nicht leer sein".to_string()));
            }
            todo.title = title.to_string();
        }
        if let Some(description) = update.description.as_deref() {
            todo.description = description.trim().to_string();
        }
        if let Some(priority) = update.priority {
            todo.priority = priority;
        }
        if let Some(due_date) = update.due_date {
            todo.due_date = Some(due_date);
        }
        if let Some(category) = update.category.as_deref() {
            let category = category.trim();
            todo.category = if category.is_empty() {
                DEFAULT_CATEGORY.to_string()
            } else {
                category.to_string()
            };
        }
        if let Some(is_recurring) = update.is_recurring {
            todo.is_recurring = is_recurring;
        }
        if update.recurrence_type.is_some() {
            todo.recurrence_type = update.recurrence_type;
        }
        if update.recurrence_day.is_some() {
            todo.recurrence_day = update.recurrence_day.clone();
        }
        validate_recurrence(
            todo.is_recurring,
            todo.recurrence_type,
            todo.recurrence_day.as_deref(),
        )?;

        match update.status {
            Some(TodoStatus::Completed) if !todo.completed => {
                self.db.update_todo(&todo)?;
                return Ok(self.complete(user_id, todo_id, now)?.completed);
            }
            Some(status) if status != TodoStatus::Completed => {
                todo.status = status;
                if status.is_active() {
                    todo.completed = false;
                    todo.completed_at = None;
                }
            }
            _ => {}
        }

        self.db.update_todo(&todo)?;
        Ok(todo)
    }

    pub fn delete(&self, user_id: &str, todo_id: &str) -> Result<(), TodoError> {
        if self.db.delete_todo(user_id, todo_id)? {
            Ok(())
        } else {
            Err(TodoError::NotFound)
        }
    }

    /// Mark done; a recurring to-do completed for the first time spawns
    /// exactly one follow-up instance.
    pub fn complete(&self, user_id: &str, todo_id: &str, now: DateTime<Utc>) -> Result<CompletionOutcome, TodoError> {
        let mut todo = self.get(user_id, todo_id)?;
        if todo.completed {
            return Ok(CompletionOutcome {
                completed: todo,
                spawned: None,
            });
        }

        todo.completed = true;
        todo.status = TodoStatus::Completed;
        todo.completed_at = Some(now);
        self.db.update_todo(&todo)?;

        let spawned = match (todo.is_recurring, todo.recurrence_type) {
            (true, Some(recurrence)) => {
                let due = next_due_date(
                    recurrence,
                    todo.recurrence_day.as_deref(),
                    todo.due_date,
                    now.date_naive(),
                );
                let child = Todo {
                    id: uuid::Uuid::new_v4().to_string(),
                    due_date: Some(due),
                    status: TodoStatus::Open,
                    completed: false,
                    completed_at: None,
                    parent_todo_id: Some(todo.id.clone()),
                    created_at: now,
                    ..todo.clone()
                };
                self.db.insert_todo(&child)?;
                tracing::info!("Recurring to-do {} renewed as {} due {}", todo.id, child.id, due);
                Some(child)
            }
            _ => None,
        };

        Ok(CompletionOutcome {
            completed: todo,
            spawned,
        })
    }

    pub fn stats(&self, user_id: &str, now: DateTime<Utc>) -> Result<TodoStats, TodoError> {
        let todos = self.db.list_todos(
            user_id,
            &TodoFilter {
                include_archived: true,
                ..TodoFilter::default()
            },
        )?;
        let today = now.date_naive();
        let week_ago = now - Duration::days(7);

        let mut stats = TodoStats {
            total: todos.len(),
            ..TodoStats::default()
        };
        for todo in &todos {
            match todo.status {
                TodoStatus::Open => stats.open += 1,
                TodoStatus::InProgress => stats.in_progress += 1,
                TodoStatus::Completed => stats.completed += 1,
                TodoStatus::Archived => stats.archived += 1,
            }
            if todo.is_overdue(today) {
                stats.overdue += 1;
            }
            if todo.completed_at.map(|at| at >= week_ago).unwrap_or(false) {
                stats.completed_last_7_days += 1;
            }
            *stats
                .by_priority
                .entry(todo.priority.as_db_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    /// Archive completed to-dos older than the configured age.
    pub fn cleanup(&self, user_id: &str, now: DateTime<Utc>) -> Result<usize, TodoError> {
        let cutoff = now - Duration::days(self.archive_after_days);
        let archived = self.db.archive_completed_before(user_id, cutoff)?;
        if archived > 0 {
            tracing::info!("Archived {} completed to-do(s) for {}", archived, user_id);
        }
        Ok(archived)
    }

    /// Open and in-progress to-dos for prompt context.
    pub fn active(&self, user_id: &str) -> Result<Vec<Todo>, TodoError> {
        let todos = self.db.list_todos(user_id, &TodoFilter::default())?;
        Ok(todos.into_iter().filter(|t| t.status.is_active()).collect())
    }
}

fn validate_recurrence(
    is_recurring: bool,
    recurrence: Option<RecurrenceType>,
    recurrence_day: Option<&str>,
) -> Result<(), TodoError> {
    if !is_recurring {
        return Ok(());
    }
    if recurrence.is_none() {
        return Err(TodoError::Invalid(
            "Wiederkehrende To-Dos brauchen einen Wiederholungstyp".to_string(),
        ));
    }
    if let Some(day) = recurrence_day.filter(|d| !d.trim().is_empty()) {
        if parse_weekday(day).is_none() {
            return Err(TodoError::Invalid(format!("Unbekannter Wochentag: {}", day)));
        }
    }
    Ok(())
}
