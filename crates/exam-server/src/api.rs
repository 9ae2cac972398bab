//! HTTP API of the reference session store.
//!
//! # Endpoints
//!
//! Student side, all under `/api/student/exams/:id`:
//!
//! - `POST /start` - Start or resume an attempt
//! - `POST /submit` - Submit answers
//! - `POST /heartbeat` - Record a heartbeat
//! - `POST /events` - Record a proctor event
//! - `GET /proctor/messages?attemptId&afterId` - Poll proctor messages
//! - `POST /result/ai` - Explain a graded question
//! - `POST /result/ai/stream` - Explain a graded question, streamed as text
//!
//! Teacher side:
//!
//! - `GET /api/teacher/exams/:id/monitor?filter&keyword&highlight` - Monitor snapshot
//! - `POST /api/teacher/attempts/:id/force-submit` - Force submit
//! - `POST /api/teacher/attempts/:id/reopen` - Reopen
//! - `POST /api/teacher/attempts/:id/remind` - Send a reminder
//! - `GET /ws/teacher/exams/:id` - Live monitor feed
//!
//! `GET /api/health` needs no credential. Every other route reads the
//! bearer token as the caller's username.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use exam_server::{create_router, AppState, MemoryStore, OllamaGenerator, ServerConfig, SystemClock};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::default();
//! let generator = OllamaGenerator::new(&config.analysis)?;
//! let store = MemoryStore::new(config, Arc::new(SystemClock));
//! let router = create_router(AppState::new(Arc::new(store), Arc::new(generator)));
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use axum::{
    async_trait,
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use exam_session::{
    Attempt, AttemptId, AttemptStart, ErrorCode, EventReceipt, EventReport, ExamId, ExplainRequest, Explanation,
    Heartbeat, MessagesQuery, MonitorQuery, MonitorSnapshot, ProctorMessage, RemindRequest, SessionError,
    SubmitReceipt, SubmitRequest,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::analysis::{build_prompt, Generator};
use crate::store::MemoryStore;
use crate::websocket::ws_handler;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for the heartbeat endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// The attempt that is alive.
    pub attempt_id: AttemptId,
    /// Client timestamp; the store's clock when absent.
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
}

/// Response body for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: String,
    /// Store clock.
    pub server_time: DateTime<Utc>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The authoritative store.
    pub store: Arc<MemoryStore>,
    /// Explanation backend.
    pub generator: Arc<dyn Generator>,
}

impl AppState {
    /// Creates the state shared by every handler.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>, generator: Arc<dyn Generator>) -> Self {
        Self { store, generator }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// A store error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(SessionError::Rejected {
            code: ErrorCode::BadRequest,
            message: message.into(),
        })
    }

    const fn status(&self) -> StatusCode {
        match self.0.code() {
            ErrorCode::InvalidAnswer | ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::WindowViolation
            | ErrorCode::AttemptLimit
            | ErrorCode::AlreadyTerminal
            | ErrorCode::InvalidTransition => StatusCode::CONFLICT,
            ErrorCode::Unavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

// ============================================================================
// Credentials
// ============================================================================

fn bearer(parts: &Parts) -> Result<String, ApiError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError(SessionError::unauthorized("missing bearer credential")))
}

/// The student a request acts for.
#[derive(Debug, Clone)]
pub struct Student(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Student {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        bearer(parts).map(Self)
    }
}

/// A caller allowed on the teacher routes.
#[derive(Debug, Clone)]
pub struct Teacher(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Teacher {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let username = bearer(parts)?;
        if state.store.is_teacher(&username) {
            Ok(Self(username))
        } else {
            Err(ApiError(SessionError::Rejected {
                code: ErrorCode::Forbidden,
                message: format!("{username} may not use teacher routes"),
            }))
        }
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all endpoints.
///
/// The router carries CORS middleware for browser clients and tracing
/// middleware for request logging.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let student_routes = Router::new()
        .route("/exams/:id/start", post(handle_start))
        .route("/exams/:id/submit", post(handle_submit))
        .route("/exams/:id/heartbeat", post(handle_heartbeat))
        .route("/exams/:id/events", post(handle_event))
        .route("/exams/:id/proctor/messages", get(handle_messages))
        .route("/exams/:id/result/ai", post(handle_explain))
        .route("/exams/:id/result/ai/stream", post(handle_explain_stream));

    let teacher_routes = Router::new()
        .route("/exams/:id/monitor", get(handle_monitor))
        .route("/attempts/:id/force-submit", post(handle_force_submit))
        .route("/attempts/:id/reopen", post(handle_reopen))
        .route("/attempts/:id/remind", post(handle_remind));

    let api_routes = Router::new()
        .nest("/student", student_routes)
        .nest("/teacher", teacher_routes)
        .route("/health", get(handle_health));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws/teacher/exams/:id", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Student Handlers
// ============================================================================

/// Handler for `POST /api/student/exams/:id/start`.
async fn handle_start(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<AttemptStart>, ApiError> {
    info!(exam_id, username = %username, "Start requested");
    let start = state.store.start_attempt(exam_id, &username).await?;
    Ok(Json(start))
}

/// Handler for `POST /api/student/exams/:id/submit`.
async fn handle_submit(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let request = json_body(body)?;
    info!(
        exam_id,
        attempt_id = request.attempt_id,
        answers = request.answers.len(),
        kind = ?request.kind,
        "Submit requested"
    );
    let receipt = state.store.submit(exam_id, &username, request).await?;
    Ok(Json(receipt))
}

/// Handler for `POST /api/student/exams/:id/heartbeat`.
async fn handle_heartbeat(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let request = json_body(body)?;
    let heartbeat = Heartbeat {
        attempt_id: request.attempt_id,
        username: username.clone(),
        ts: request.ts.unwrap_or_else(|| state.store.now()),
    };
    state.store.record_heartbeat(exam_id, &username, heartbeat).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/student/exams/:id/events`.
async fn handle_event(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<EventReport>, JsonRejection>,
) -> Result<Json<EventReceipt>, ApiError> {
    let report = json_body(body)?;
    let event_id = state.store.record_event(exam_id, &username, report).await?;
    Ok(Json(EventReceipt { event_id }))
}

/// Handler for `GET /api/student/exams/:id/proctor/messages`.
async fn handle_messages(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    params: Result<Query<MessagesQuery>, QueryRejection>,
) -> Result<Json<Vec<ProctorMessage>>, ApiError> {
    let params = query(params)?;
    let messages = state
        .store
        .list_messages(exam_id, &username, params.attempt_id, params.after_id)
        .await?;
    Ok(Json(messages))
}

async fn explain_prompt(
    state: &AppState,
    exam_id: ExamId,
    username: &str,
    request: &ExplainRequest,
) -> Result<String, ApiError> {
    let context = state
        .store
        .explain_context(exam_id, username, request.question_id)
        .await?;
    let limit = state.store.config().analysis.history_limit;
    Ok(build_prompt(&context, &request.messages, limit))
}

/// Handler for `POST /api/student/exams/:id/result/ai`.
async fn handle_explain(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<ExplainRequest>, JsonRejection>,
) -> Result<Json<Explanation>, ApiError> {
    let request = json_body(body)?;
    info!(exam_id, question_id = request.question_id, "Explanation requested");
    let prompt = explain_prompt(&state, exam_id, &username, &request).await?;
    let content = state.generator.generate(&prompt).await?;
    Ok(Json(Explanation { content }))
}

/// Handler for `POST /api/student/exams/:id/result/ai/stream`.
///
/// Fragments are written as they arrive. A backend failure after the first
/// byte aborts the body.
async fn handle_explain_stream(
    Student(username): Student,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<ExplainRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = json_body(body)?;
    info!(exam_id, question_id = request.question_id, "Streamed explanation requested");
    let prompt = explain_prompt(&state, exam_id, &username, &request).await?;
    let fragments = state.generator.generate_stream(&prompt).await?;

    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Body::from_stream(fragments)).into_response())
}

// ============================================================================
// Teacher Handlers
// ============================================================================

/// Handler for `GET /api/teacher/exams/:id/monitor`.
async fn handle_monitor(
    Teacher(_): Teacher,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
    params: Result<Query<MonitorQuery>, QueryRejection>,
) -> Result<Json<MonitorSnapshot>, ApiError> {
    let params = query(params)?;
    let snapshot = state.store.monitor(exam_id, &params).await?;
    Ok(Json(snapshot))
}

/// Handler for `POST /api/teacher/attempts/:id/force-submit`.
async fn handle_force_submit(
    Teacher(teacher): Teacher,
    Path(attempt_id): Path<AttemptId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Attempt>, ApiError> {
    info!(attempt_id, teacher = %teacher, "Force submit requested");
    let attempt = state.store.force_submit(attempt_id).await?;
    Ok(Json(attempt))
}

/// Handler for `POST /api/teacher/attempts/:id/reopen`.
async fn handle_reopen(
    Teacher(teacher): Teacher,
    Path(attempt_id): Path<AttemptId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Attempt>, ApiError> {
    info!(attempt_id, teacher = %teacher, "Reopen requested");
    let attempt = state.store.reopen(attempt_id).await?;
    Ok(Json(attempt))
}

/// Handler for `POST /api/teacher/attempts/:id/remind`.
async fn handle_remind(
    Teacher(_): Teacher,
    Path(attempt_id): Path<AttemptId>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<RemindRequest>, JsonRejection>,
) -> Result<Json<ProctorMessage>, ApiError> {
    let request = json_body(body)?;
    let message = state.store.remind(attempt_id, &request.message).await?;
    Ok(Json(message))
}

/// Handler for `GET /api/health`.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        server_time: state.store.now(),
    })
}

// ============================================================================
// Tests
// ============================================================================
