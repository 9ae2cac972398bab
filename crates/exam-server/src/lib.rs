//! Exam Session Server
//!
//! In-memory reference session store: HTTP API, live monitor feed over
//! WebSocket, the closing sweep and the explanation backend proxy.

pub mod analysis;
pub mod api;
pub mod clock;
pub mod config;
pub mod grading;
pub mod maintenance;
pub mod store;
pub mod websocket;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use analysis::{build_prompt, ndjson_fragments, Generator, OllamaGenerator};
pub use api::{create_router, ApiError, AppState, HealthResponse, HeartbeatRequest, Student, Teacher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnalysisConfig, ExamDefinition, ServerConfig, CONFIG_FILE};
pub use grading::{grade, is_correct, ExamResult, ResultItem};
pub use store::{ExplainContext, MemoryStore};
pub use websocket::{AttemptPayload, MonitorEvent};

/// Serves `state` on `listener` until `shutdown` fires.
///
/// The maintenance sweep runs alongside the server and stops with it.
///
/// # Errors
///
/// Returns the I/O error that ended the server.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let store = Arc::clone(&state.store);
    let every = store.config().maintenance_interval();
    let sweep = maintenance::spawn(store, every, shutdown.child_token());

    let router = create_router(state);
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    if let Err(e) = sweep.await {
        tracing::warn!(error = %e, "Maintenance task ended abnormally");
    }
    result
}
