use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::chat::{ChatOrchestrator, CHAT_FAILURE_MESSAGE};
use crate::database::CoachDatabase;
use crate::goals::{Goal, NewGoal};
use crate::profile::{apply_profile_update, profile_map};
use crate::questions::EntryQuestionGenerator;
use crate::reports::{AutomaticReview, MemoryEntry, ReportError, ReviewGenerator};
use crate::routines::{NewRoutine, Routine, RoutineError, RoutineTracker, RoutineView};
use crate::runtime::BackendRuntime;
use crate::todos::{
    CompletionOutcome, NewTodo, Todo, TodoError, TodoFilter, TodoStats, TodoTracker, TodoUpdate,
};

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<CoachDatabase>,
    pub chat: Arc<ChatOrchestrator>,
    pub questions: Arc<EntryQuestionGenerator>,
    pub reviews: Arc<ReviewGenerator>,
    pub routines: Arc<RoutineTracker>,
    pub todos: Arc<TodoTracker>,
    pub auth: BackendAuthConfig,
}

impl ServerState {
    pub fn from_runtime(runtime: &BackendRuntime, auth: BackendAuthConfig) -> Self {
        Self {
            db: runtime.db.clone(),
            chat: runtime.chat.clone(),
            questions: runtime.questions.clone(),
            reviews: runtime.reviews.clone(),
            routines: runtime.routines.clone(),
            todos: runtime.todos.clone(),
            auth,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct QuestionResponse {
    frage: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    inhalt: String,
}

#[derive(Debug, Serialize)]
struct RoutinesResponse {
    routines: Vec<RoutineView>,
}

#[derive(Debug, Deserialize)]
struct RoutineUpdateRequest {
    id: String,
    checked: bool,
    user_id: String,
}

/// Ad hoc status body used by the update-style endpoints.
#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl StatusResponse {
    fn success() -> Self {
        Self {
            status: "success",
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct GoalsResponse {
    goals: Vec<Goal>,
}

#[derive(Debug, Deserialize)]
struct GoalUpdateRequest {
    id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ListMemoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct MemoryResponse {
    memory: Vec<MemoryEntry>,
}

#[derive(Debug, Deserialize)]
struct NewMemoryRequest {
    thema: String,
    inhalt: String,
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    profile: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ProfileUpdateResponse {
    updated: usize,
}

#[derive(Debug, Serialize)]
struct TodosResponse {
    todos: Vec<Todo>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    archived: usize,
}

pub async fn serve_backend(mut runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}' (expected host:port)", runtime.config.bind_addr))?;

    let auth = load_auth_config()?;
    let _background = runtime.spawn_background_tasks();
    let state = Arc::new(ServerState::from_runtime(&runtime, auth));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Mentor backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start_interaction/:user_id", get(start_interaction))
        .route("/chat/:user_id", post(chat))
        .route("/bericht/automatisch", get(automatic_report))
        .route("/bericht/abrufen/:report_type", get(fetch_report))
        .route("/routines/update", post(update_routine))
        .route("/routines/:user_id", get(list_routines).post(create_routine))
        .route("/routines/:user_id/:routine_id", delete(delete_routine))
        .route("/goals/update/:user_id", post(update_goal))
        .route("/goals/:user_id", get(list_goals).post(create_goal))
        .route("/memory/:user_id", get(list_memory).post(create_memory))
        .route("/profile/:user_id", get(get_profile).post(update_profile))
        .route("/todos/stats/:user_id", get(todo_stats))
        .route("/todos/cleanup/:user_id", post(cleanup_todos))
        .route("/todos/:user_id", get(list_todos).post(create_todo))
        .route(
            "/todos/:user_id/:todo_id",
            put(update_todo).delete(delete_todo),
        )
        .route("/todos/:user_id/:todo_id/complete", post(complete_todo))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(CorsLayer::permissive())
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("MENTOR_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("MENTOR_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "MENTOR_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "disabled".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "" | "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid MENTOR_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn start_interaction(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<QuestionResponse>, ApiError> {
    state
        .questions
        .start_interaction(&user_id, Utc::now())
        .await
        .map(|frage| Json(QuestionResponse { frage }))
        .map_err(internal_error)
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(bad_request("Nachricht darf nicht leer sein"));
    }
    match state.chat.handle_chat(&user_id, &body.message, Utc::now()).await {
        Ok(response) => Ok(Json(ChatResponse { response })),
        Err(e) => {
            tracing::error!("Chat for {} failed: {:#}", user_id, e);
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, CHAT_FAILURE_MESSAGE))
        }
    }
}

async fn automatic_report(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<AutomaticReview>, ApiError> {
    state
        .reviews
        .run_automatic_review(&query.user_id, Utc::now())
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn fetch_report(
    State(state): State<Arc<ServerState>>,
    Path(report_type): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ReportResponse>, ApiError> {
    match state.reviews.latest_report(&query.user_id, &report_type) {
        Ok(inhalt) => Ok(Json(ReportResponse { inhalt })),
        Err(e @ ReportError::UnknownType(_)) => Err(bad_request(e.to_string())),
        Err(ReportError::Store(e)) => Err(internal_error(e)),
    }
}

async fn list_routines(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<RoutinesResponse>, ApiError> {
    state
        .routines
        .list_routines(&user_id, Utc::now())
        .map(|routines| Json(RoutinesResponse { routines }))
        .map_err(internal_error)
}

async fn create_routine(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<NewRoutine>,
) -> Result<Json<Routine>, ApiError> {
    state
        .routines
        .create_routine(&user_id, &body, Utc::now())
        .map(Json)
        .map_err(routine_error)
}

async fn delete_routine(
    State(state): State<Arc<ServerState>>,
    Path((user_id, routine_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .routines
        .delete_routine(&user_id, &routine_id)
        .map(|_| Json(StatusResponse::success()))
        .map_err(routine_error)
}

async fn update_routine(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RoutineUpdateRequest>,
) -> Json<StatusResponse> {
    match state
        .routines
        .update_routine_status(&body.user_id, &body.id, body.checked, Utc::now())
    {
        Ok(_) => Json(StatusResponse::success()),
        Err(RoutineError::Store(e)) => {
            tracing::error!("Routine update {} failed: {:#}", body.id, e);
            Json(StatusResponse::error("Routine konnte nicht aktualisiert werden"))
        }
        Err(e) => Json(StatusResponse::error(e.to_string())),
    }
}

async fn list_goals(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<GoalsResponse>, ApiError> {
    state
        .db
        .list_goals(&user_id, None)
        .map(|goals| Json(GoalsResponse { goals }))
        .map_err(internal_error)
}

async fn create_goal(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<NewGoal>,
) -> Result<Json<Goal>, ApiError> {
    let Some(goal) = body.normalized() else {
        return Err(bad_request("Titel darf nicht leer sein"));
    };
    state
        .db
        .insert_goal(&user_id, &goal, Utc::now())
        .map(Json)
        .map_err(internal_error)
}

async fn update_goal(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<GoalUpdateRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = body.status.trim();
    if status.is_empty() {
        return Ok(Json(StatusResponse::error("Status darf nicht leer sein")));
    }
    let updated = state
        .db
        .update_goal_status(&user_id, body.id, status)
        .map_err(internal_error)?;
    if updated {
        Ok(Json(StatusResponse::success()))
    } else {
        Ok(Json(StatusResponse::error("Ziel nicht gefunden")))
    }
}

async fn list_memory(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Query(query): Query<ListMemoryQuery>,
) -> Result<Json<MemoryResponse>, ApiError> {
    let limit = clamp_limit(query.limit, 20, 1, 200);
    state
        .db
        .recent_memory_entries(&user_id, limit)
        .map(|memory| Json(MemoryResponse { memory }))
        .map_err(internal_error)
}

async fn create_memory(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<NewMemoryRequest>,
) -> Result<Json<MemoryEntry>, ApiError> {
    let thema = body.thema.trim();
    let inhalt = body.inhalt.trim();
    if thema.is_empty() || inhalt.is_empty() {
        return Err(bad_request("Thema und Inhalt dürfen nicht leer sein"));
    }
    let entry = MemoryEntry::new(&user_id, thema, inhalt, Utc::now());
    state
        .db
        .insert_memory_entry(&entry)
        .map_err(internal_error)?;
    Ok(Json(entry))
}

async fn get_profile(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<ProfileResponse>, ApiError> {
    state
        .db
        .list_profile(&user_id)
        .map(|attributes| {
            Json(ProfileResponse {
                profile: profile_map(&attributes),
            })
        })
        .map_err(internal_error)
}

async fn update_profile(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<ProfileUpdateResponse>, ApiError> {
    apply_profile_update(&state.db, &user_id, &body, Utc::now())
        .map(|updated| Json(ProfileUpdateResponse { updated }))
        .map_err(internal_error)
}

async fn list_todos(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Query(filter): Query<TodoFilter>,
) -> Result<Json<TodosResponse>, ApiError> {
    state
        .todos
        .list(&user_id, &filter)
        .map(|todos| Json(TodosResponse { todos }))
        .map_err(todo_error)
}

async fn create_todo(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<NewTodo>,
) -> Result<Json<Todo>, ApiError> {
    state
        .todos
        .create(&user_id, &body, Utc::now())
        .map(Json)
        .map_err(todo_error)
}

async fn update_todo(
    State(state): State<Arc<ServerState>>,
    Path((user_id, todo_id)): Path<(String, String)>,
    Json(body): Json<TodoUpdate>,
) -> Result<Json<Todo>, ApiError> {
    state
        .todos
        .update(&user_id, &todo_id, &body, Utc::now())
        .map(Json)
        .map_err(todo_error)
}

async fn delete_todo(
    State(state): State<Arc<ServerState>>,
    Path((user_id, todo_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .todos
        .delete(&user_id, &todo_id)
        .map(|_| Json(StatusResponse::success()))
        .map_err(todo_error)
}

async fn complete_todo(
    State(state): State<Arc<ServerState>>,
    Path((user_id, todo_id)): Path<(String, String)>,
) -> Result<Json<CompletionOutcome>, ApiError> {
    state
        .todos
        .complete(&user_id, &todo_id, Utc::now())
        .map(Json)
        .map_err(todo_error)
}

async fn todo_stats(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<TodoStats>, ApiError> {
    state
        .todos
        .stats(&user_id, Utc::now())
        .map(Json)
        .map_err(todo_error)
}

async fn cleanup_todos(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    state
        .todos
        .cleanup(&user_id, Utc::now())
        .map(|archived| Json(CleanupResponse { archived }))
        .map_err(todo_error)
}

fn routine_error(error: RoutineError) -> ApiError {
    match error {
        RoutineError::NotFound => not_found(error.to_string()),
        RoutineError::Store(e) => internal_error(e),
        other => bad_request(other.to_string()),
    }
}

fn todo_error(error: TodoError) -> ApiError {
    match error {
        TodoError::NotFound => not_found(error.to_string()),
        TodoError::Invalid(message) => bad_request(message),
        TodoError::Store(e) => internal_error(e),
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn error_body(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
}

fn bad_request(detail: impl Into<String>) -> ApiError {
    error_body(StatusCode::BAD_REQUEST, detail)
}

fn not_found(detail: impl Into<String>) -> ApiError {
    error_body(StatusCode::NOT_FOUND, detail)
}

fn internal_error(error: anyhow::Error) -> ApiError {
    tracing::error!("Request failed: {:#}", error);
    error_body(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
