use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use mentor_backend::goals::Goal;
use mentor_backend::reports::{AutomaticReview, ReportKind};
use mentor_backend::todos::{Priority, RecurrenceType, Todo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, Deserialize)]
pub struct Routine {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub time: String,
    pub checked: bool,
    pub display_date: String,
    #[serde(default)]
    pub missed_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionOutcome {
    pub completed: Todo,
    pub spawned: Option<Todo>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug, Deserialize)]
struct QuestionResponse {
    frage: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct RoutinesResponse {
    routines: Vec<Routine>,
}

#[derive(Debug, Deserialize)]
struct GoalsResponse {
    goals: Vec<Goal>,
}

#[derive(Debug, Deserialize)]
struct TodosResponse {
    todos: Vec<Todo>,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    inhalt: String,
}

#[derive(Debug, Deserialize)]
struct CleanupResponse {
    archived: usize,
}

/// Optional fields for `POST /todos/{user_id}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewTodo {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub is_recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence_type: Option<RecurrenceType>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("MENTOR_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let token = std::env::var("MENTOR_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(&base_url),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn start_interaction(&self, user_id: &str) -> Result<String> {
        let path = format!("/start_interaction/{}", user_id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let body: QuestionResponse = decode(response, &path).await?;
        Ok(body.frage)
    }

    pub async fn chat(&self, user_id: &str, message: &str) -> Result<String> {
        #[derive(Serialize)]
        struct ChatRequest<'a> {
            message: &'a str,
        }

        let path = format!("/chat/{}", user_id);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&ChatRequest { message })
            .send()
            .await?;
        let body: ChatResponse = decode(response, &path).await?;
        Ok(body.response)
    }

    pub async fn list_routines(&self, user_id: &str) -> Result<Vec<Routine>> {
        let path = format!("/routines/{}", user_id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let body: RoutinesResponse = decode(response, &path).await?;
        Ok(body.routines)
    }

    pub async fn set_routine_checked(&self, user_id: &str, routine_id: &str, checked: bool) -> Result<()> {
        #[derive(Serialize)]
        struct RoutineUpdateRequest<'a> {
            id: &'a str,
            checked: bool,
            user_id: &'a str,
        }

        let response = self
            .request(reqwest::Method::POST, "/routines/update")
            .json(&RoutineUpdateRequest {
                id: routine_id,
                checked,
                user_id,
            })
            .send()
            .await?;
        let body: StatusResponse = decode(response, "/routines/update").await?;
        status_result(body)
    }

    pub async fn list_goals(&self, user_id: &str) -> Result<Vec<Goal>> {
        let path = format!("/goals/{}", user_id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let body: GoalsResponse = decode(response, &path).await?;
        Ok(body.goals)
    }

    pub async fn create_goal(&self, user_id: &str, titel: &str, deadline: Option<&str>) -> Result<Goal> {
        #[derive(Serialize)]
        struct NewGoalRequest<'a> {
            titel: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            deadline: Option<&'a str>,
        }

        let path = format!("/goals/{}", user_id);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&NewGoalRequest { titel, deadline })
            .send()
            .await?;
        decode(response, &path).await
    }

    pub async fn update_goal(&self, user_id: &str, goal_id: i64, status: &str) -> Result<()> {
        #[derive(Serialize)]
        struct GoalUpdateRequest<'a> {
            id: i64,
            status: &'a str,
        }

        let path = format!("/goals/update/{}", user_id);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&GoalUpdateRequest { id: goal_id, status })
            .send()
            .await?;
        let body: StatusResponse = decode(response, &path).await?;
        status_result(body)
    }

    pub async fn list_todos(&self, user_id: &str, include_archived: bool) -> Result<Vec<Todo>> {
        let path = format!("/todos/{}", user_id);
        let response = self
            .request(reqwest::Method::GET, &path)
            .query(&[("include_archived", include_archived)])
            .send()
            .await?;
        let body: TodosResponse = decode(response, &path).await?;
        Ok(body.todos)
    }

    pub async fn create_todo(&self, user_id: &str, todo: &NewTodo) -> Result<Todo> {
        let path = format!("/todos/{}", user_id);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(todo)
            .send()
            .await?;
        decode(response, &path).await
    }

    pub async fn complete_todo(&self, user_id: &str, todo_id: &str) -> Result<CompletionOutcome> {
        let path = format!("/todos/{}/{}/complete", user_id, todo_id);
        let response = self.request(reqwest::Method::POST, &path).send().await?;
        decode(response, &path).await
    }

    pub async fn delete_todo(&self, user_id: &str, todo_id: &str) -> Result<()> {
        let path = format!("/todos/{}/{}", user_id, todo_id);
        let response = self.request(reqwest::Method::DELETE, &path).send().await?;
        let body: StatusResponse = decode(response, &path).await?;
        status_result(body)
    }

    /// Raw stats object; the client only pretty-prints it.
    pub async fn todo_stats(&self, user_id: &str) -> Result<Value> {
        let path = format!("/todos/stats/{}", user_id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        decode(response, &path).await
    }

    pub async fn cleanup_todos(&self, user_id: &str) -> Result<usize> {
        let path = format!("/todos/cleanup/{}", user_id);
        let response = self.request(reqwest::Method::POST, &path).send().await?;
        let body: CleanupResponse = decode(response, &path).await?;
        Ok(body.archived)
    }

    pub async fn automatic_report(&self, user_id: &str) -> Result<AutomaticReview> {
        let path = "/bericht/automatisch";
        let response = self
            .request(reqwest::Method::GET, path)
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        decode(response, path).await
    }

    pub async fn fetch_report(&self, user_id: &str, kind: ReportKind) -> Result<String> {
        let path = format!("/bericht/abrufen/{}", kind.label());
        let response = self
            .request(reqwest::Method::GET, &path)
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        let body: ReportResponse = decode(response, &path).await?;
        Ok(body.inhalt)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

/// Decode a JSON body, surfacing the backend's `detail` on error statuses.
async fn decode<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read response of {}", what))?;

    if !status.is_success() {
        return Err(anyhow!("{} failed ({}): {}", what, status, error_detail(&body)));
    }

    serde_json::from_str::<T>(&body).with_context(|| {
        format!(
            "Failed to decode response of {}. Payload preview: {}",
            what,
            body.chars().take(500).collect::<String>()
        )
    })
}

fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.detail,
        Err(_) if body.trim().is_empty() => "keine Details".to_string(),
        Err(_) => body.chars().take(200).collect(),
    }
}

fn status_result(body: StatusResponse) -> Result<()> {
    if body.status == "success" {
        Ok(())
    } else {
        Err(anyhow!(
            "{}",
            body.message.unwrap_or_else(|| "Unbekannter Fehler".to_string())
        ))
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}
