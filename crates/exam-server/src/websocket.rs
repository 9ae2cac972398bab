//! Live monitor feed for teacher views.
//!
//! Every change the store accepts is broadcast as a [`MonitorEvent`]. A
//! teacher connected to `/ws/teacher/exams/:id` receives a `connected` event
//! with a full monitor snapshot, then every event of that exam.
//!
//! # Event Types
//!
//! - `connected` - Sent when a client connects, includes a snapshot
//! - `attempt_started` - A student started an attempt
//! - `attempt_submitted` - An attempt reached a terminal state
//! - `attempt_reopened` - A proctor reopened an attempt
//! - `heartbeat` - A newer heartbeat was recorded
//! - `proctor_event` - A client reported a proctor event
//! - `message_sent` - A proctor message was queued for a student

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use exam_session::{Attempt, AttemptId, ExamId, Heartbeat, MonitorQuery, MonitorSnapshot, ProctorEvent, ProctorMessage};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AppState, Teacher};

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Monitor snapshot at connect time.
    pub snapshot: MonitorSnapshot,
}

/// Payload for attempt lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptPayload {
    /// The attempt after the change.
    pub attempt: Attempt,
}

/// Payload for the `heartbeat` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Exam of the attempt.
    pub exam_id: ExamId,
    /// The recorded heartbeat.
    pub heartbeat: Heartbeat,
}

/// Payload for the `proctor_event` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctorEventPayload {
    /// Exam of the attempt.
    pub exam_id: ExamId,
    /// The recorded event.
    pub event: ProctorEvent,
}

/// Payload for the `message_sent` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Exam of the attempt.
    pub exam_id: ExamId,
    /// Recipient attempt.
    pub attempt_id: AttemptId,
    /// The queued message.
    pub message: ProctorMessage,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Monitor feed events.
///
/// Serialized as JSON objects with "event" and "payload" fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Sent when a client connects.
    Connected(ConnectedPayload),
    /// A student started an attempt.
    AttemptStarted(AttemptPayload),
    /// An attempt reached a terminal state.
    AttemptSubmitted(AttemptPayload),
    /// A proctor reopened an attempt.
    AttemptReopened(AttemptPayload),
    /// A newer heartbeat was recorded.
    Heartbeat(HeartbeatPayload),
    /// A client reported a proctor event.
    ProctorEvent(ProctorEventPayload),
    /// A proctor message was queued.
    MessageSent(MessagePayload),
}

impl MonitorEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(snapshot: MonitorSnapshot) -> Self {
        Self::Connected(ConnectedPayload { snapshot })
    }

    /// Creates an `AttemptStarted` event.
    #[must_use]
    pub const fn attempt_started(attempt: Attempt) -> Self {
        Self::AttemptStarted(AttemptPayload { attempt })
    }

    /// Creates an `AttemptSubmitted` event.
    #[must_use]
    pub const fn attempt_submitted(attempt: Attempt) -> Self {
        Self::AttemptSubmitted(AttemptPayload { attempt })
    }

    /// Creates an `AttemptReopened` event.
    #[must_use]
    pub const fn attempt_reopened(attempt: Attempt) -> Self {
        Self::AttemptReopened(AttemptPayload { attempt })
    }

    /// Creates a `Heartbeat` event.
    #[must_use]
    pub const fn heartbeat(exam_id: ExamId, heartbeat: Heartbeat) -> Self {
        Self::Heartbeat(HeartbeatPayload { exam_id, heartbeat })
    }

    /// Creates a `ProctorEvent` event.
    #[must_use]
    pub const fn proctor_event(exam_id: ExamId, event: ProctorEvent) -> Self {
        Self::ProctorEvent(ProctorEventPayload { exam_id, event })
    }

    /// Creates a `MessageSent` event.
    #[must_use]
    pub const fn message_sent(exam_id: ExamId, attempt_id: AttemptId, message: ProctorMessage) -> Self {
        Self::MessageSent(MessagePayload {
            exam_id,
            attempt_id,
            message,
        })
    }

    /// The exam this event belongs to.
    #[must_use]
    pub const fn exam_id(&self) -> ExamId {
        match self {
            Self::Connected(p) => p.snapshot.exam_id,
            Self::AttemptStarted(p) | Self::AttemptSubmitted(p) | Self::AttemptReopened(p) => p.attempt.exam_id,
            Self::Heartbeat(p) => p.exam_id,
            Self::ProctorEvent(p) => p.exam_id,
            Self::MessageSent(p) => p.exam_id,
        }
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::AttemptStarted(_) => "attempt_started",
            Self::AttemptSubmitted(_) => "attempt_submitted",
            Self::AttemptReopened(_) => "attempt_reopened",
            Self::Heartbeat(_) => "heartbeat",
            Self::ProctorEvent(_) => "proctor_event",
            Self::MessageSent(_) => "message_sent",
        }
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Interval between pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// Handler for `GET /ws/teacher/exams/:id`.
///
/// Checks the exam exists before upgrading so an unknown id is a plain 404.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Teacher(username): Teacher,
    Path(exam_id): Path<ExamId>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    state.store.exam(exam_id)?;
    info!(exam_id, teacher = %username, "New monitor connection request");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, exam_id)))
}

fn to_text(event: &MonitorEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!(event = event.event_name(), error = %e, "Failed to serialize monitor event");
            None
        }
    }
}

/// Handles a single monitor connection.
///
/// - Subscribes before reading the snapshot, so nothing between the two is lost
/// - Sends `connected` with the snapshot immediately
/// - Forwards every event of the exam
/// - Pings every 30 seconds and closes after 3 missed pongs
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, exam_id: ExamId) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_receiver = state.store.feed().subscribe();

    let snapshot = match state.store.monitor(exam_id, &MonitorQuery::default()).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(exam_id, error = %e, "Failed to build monitor snapshot");
            return;
        }
    };

    let Some(connected) = to_text(&MonitorEvent::connected(snapshot)) else {
        return;
    };
    if sender.send(connected).await.is_err() {
        debug!("Client disconnected before receiving connected event");
        return;
    }

    info!(exam_id, "Monitor client connected, sent snapshot");

    let mut ping_interval = interval(PING_INTERVAL);
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                        debug!("Received pong from client");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(exam_id, "Client requested close");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            debug!("Failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring data message from client");
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }

            event = event_receiver.recv() => {
                match event {
                    Ok(event) if event.exam_id() == exam_id => {
                        let Some(text) = to_text(&event) else { continue };
                        if sender.send(text).await.is_err() {
                            debug!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(exam_id, missed = n, "Monitor client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Monitor feed closed");
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    debug!("Failed to send ping, client disconnected");
                    break;
                }
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    info!(exam_id, "Client missed {} pongs, closing connection", MAX_MISSED_PONGS);
                    break;
                }
            }
        }
    }

    info!(exam_id, "Monitor client disconnected");
}
