//! Notifications published by the attempt controller.
//!
//! Whatever UI embeds the controller subscribes to an [`AttemptEvent`] feed
//! instead of polling status. Events are serialized as JSON objects with
//! `event` and `payload` fields so they can be forwarded over a socket as-is.
//!
//! # Event Types
//!
//! - `started` - The attempt is in progress, countdown armed
//! - `reminder` - A proctor reminder arrived
//! - `submitted` - The attempt reached a terminal state
//! - `reopened` - A proctor reopened the attempt
//! - `deadline_reached` - The countdown hit zero
//! - `submit_failed` - A submit exhausted its retries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::attempt::{AttemptId, AttemptStatus};
use crate::proctor::MessageId;

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `started` and `reopened` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePayload {
    /// The attempt.
    pub attempt_id: AttemptId,
    /// The deadline the countdown runs against.
    pub end_at: DateTime<Utc>,
}

/// Payload for the `reminder` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPayload {
    /// The message id.
    pub message_id: MessageId,
    /// Text to show the student.
    pub message: String,
}

/// Payload for the `submitted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedPayload {
    /// The attempt.
    pub attempt_id: AttemptId,
    /// Terminal status recorded by the store.
    pub status: AttemptStatus,
}

/// Payload for the `deadline_reached` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlinePayload {
    /// The attempt.
    pub attempt_id: AttemptId,
    /// Whether the controller is submitting because of it.
    pub auto_submit: bool,
}

/// Payload for the `submit_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFailedPayload {
    /// The attempt.
    pub attempt_id: AttemptId,
    /// Last error seen.
    pub message: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Controller notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum AttemptEvent {
    /// The attempt is in progress.
    Started(ActivePayload),
    /// A proctor reminder arrived.
    Reminder(ReminderPayload),
    /// The attempt is terminal.
    Submitted(SubmittedPayload),
    /// A proctor reopened the attempt.
    Reopened(ActivePayload),
    /// The countdown reached zero.
    DeadlineReached(DeadlinePayload),
    /// A submit exhausted its retries; the attempt is still in progress.
    SubmitFailed(SubmitFailedPayload),
}

impl AttemptEvent {
    /// Creates a `Started` event.
    #[must_use]
    pub const fn started(attempt_id: AttemptId, end_at: DateTime<Utc>) -> Self {
        Self::Started(ActivePayload { attempt_id, end_at })
    }

    /// Creates a `Reminder` event.
    #[must_use]
    pub const fn reminder(message_id: MessageId, message: String) -> Self {
        Self::Reminder(ReminderPayload { message_id, message })
    }

    /// Creates a `Submitted` event.
    #[must_use]
    pub const fn submitted(attempt_id: AttemptId, status: AttemptStatus) -> Self {
        Self::Submitted(SubmittedPayload { attempt_id, status })
    }

    /// Creates a `Reopened` event.
    #[must_use]
    pub const fn reopened(attempt_id: AttemptId, end_at: DateTime<Utc>) -> Self {
        Self::Reopened(ActivePayload { attempt_id, end_at })
    }

    /// Creates a `DeadlineReached` event.
    #[must_use]
    pub const fn deadline_reached(attempt_id: AttemptId, auto_submit: bool) -> Self {
        Self::DeadlineReached(DeadlinePayload {
            attempt_id,
            auto_submit,
        })
    }

    /// Creates a `SubmitFailed` event.
    #[must_use]
    pub fn submit_failed(attempt_id: AttemptId, message: impl Into<String>) -> Self {
        Self::SubmitFailed(SubmitFailedPayload {
            attempt_id,
            message: message.into(),
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::Reminder(_) => "reminder",
            Self::Submitted(_) => "submitted",
            Self::Reopened(_) => "reopened",
            Self::DeadlineReached(_) => "deadline_reached",
            Self::SubmitFailed(_) => "submit_failed",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Broadcasts events to every subscriber.
///
/// Uses a tokio broadcast channel for pub-sub distribution. Events are not
/// kept for subscribers that join later.
#[derive(Debug, Clone)]
pub struct EventBroadcaster<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBroadcaster<E> {
    /// Creates a broadcaster that queues up to `capacity` events per
    /// subscriber before the oldest are dropped.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a new subscriber.
    ///
    /// A subscriber that falls behind receives a `Lagged` error and misses
    /// some events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Broadcasts an event, returning the number of receivers.
    pub fn send(&self, event: E) -> usize {
        // Err only means nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBroadcaster<E> {
    fn default() -> Self {
        Self::new(100)
    }
}
