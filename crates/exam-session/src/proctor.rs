//! Proctoring records: heartbeats, integrity events, and teacher messages.
//!
//! Event and message ids are assigned by the session store and strictly
//! increase. The client never invents them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::AttemptId;

/// Identifier of a proctor message.
pub type MessageId = u64;
/// Identifier of a proctor event.
pub type EventId = u64;

// ============================================================================
// Messages (teacher -> student)
// ============================================================================

/// Control and notice messages a proctor can send to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Free-text notice with no state effect.
    Reminder,
    /// Submit the attempt now.
    ForceSubmit,
    /// The attempt may continue after a terminal state.
    Reopen,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reminder => "REMINDER",
            Self::ForceSubmit => "FORCE_SUBMIT",
            Self::Reopen => "REOPEN",
        };
        write!(f, "{s}")
    }
}

/// A message from the proctor, as returned by the message poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctorMessage {
    /// Store-assigned id, strictly increasing per attempt.
    pub id: MessageId,
    /// What the message asks for.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Display text.
    #[serde(default)]
    pub message: String,
    /// When the store recorded the message.
    pub created_at: DateTime<Utc>,
}

/// Last message id the client has consumed.
///
/// Starts at "none seen". [`MessageCursor::accept`] advances to the largest id
/// observed and never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCursor(Option<MessageId>);

impl MessageCursor {
    /// A cursor that has not seen any message.
    #[must_use]
    pub const fn new() -> Self {
        Self(None)
    }

    /// A cursor positioned after `id`.
    #[must_use]
    pub const fn at(id: MessageId) -> Self {
        Self(Some(id))
    }

    /// The id to send as `afterId`, if any.
    #[must_use]
    pub const fn position(&self) -> Option<MessageId> {
        self.0
    }

    /// Returns `true` if a message with this id has not been consumed yet.
    #[must_use]
    pub fn is_new(&self, id: MessageId) -> bool {
        self.0.map_or(true, |seen| id > seen)
    }

    /// Drops already-consumed messages, sorts the rest by id, and advances.
    ///
    /// Returns the messages to act on, in id order.
    pub fn accept(&mut self, mut messages: Vec<ProctorMessage>) -> Vec<ProctorMessage> {
        messages.retain(|m| self.is_new(m.id));
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        if let Some(last) = messages.last() {
            self.0 = Some(last.id);
        }
        messages
    }
}

// ============================================================================
// Events (student -> store)
// ============================================================================

/// Type tag of a proctor event.
///
/// Known browser integrity signals have dedicated variants; any other tag is
/// carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// The exam window lost focus.
    WindowBlur,
    /// The exam window regained focus.
    WindowFocus,
    /// The exam page became hidden.
    VisibilityHidden,
    /// The exam page became visible again.
    VisibilityVisible,
    /// The student left fullscreen mode.
    FullscreenExit,
    /// Any other tag.
    Custom(CustomTag),
}

/// An event tag outside the known set.
///
/// Only [`EventKind::from`] builds one, so a known tag always gets its own
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CustomTag(String);

impl CustomTag {
    /// The tag as sent.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl EventKind {
    /// The wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::WindowBlur => "WINDOW_BLUR",
            Self::WindowFocus => "WINDOW_FOCUS",
            Self::VisibilityHidden => "VISIBILITY_HIDDEN",
            Self::VisibilityVisible => "VISIBILITY_VISIBLE",
            Self::FullscreenExit => "FULLSCREEN_EXIT",
            Self::Custom(tag) => tag.as_str(),
        }
    }

    /// The student moved away from the exam.
    #[must_use]
    pub const fn is_leave(&self) -> bool {
        matches!(self, Self::WindowBlur | Self::VisibilityHidden)
    }

    /// The student came back to the exam.
    #[must_use]
    pub const fn is_return(&self) -> bool {
        matches!(self, Self::WindowFocus | Self::VisibilityVisible)
    }

    /// Focus or visibility change, recorded only when the exam asks for it.
    #[must_use]
    pub const fn is_tab_switch(&self) -> bool {
        self.is_leave() || self.is_return()
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "WINDOW_BLUR" => Self::WindowBlur,
            "WINDOW_FOCUS" => Self::WindowFocus,
            "VISIBILITY_HIDDEN" => Self::VisibilityHidden,
            "VISIBILITY_VISIBLE" => Self::VisibilityVisible,
            "FULLSCREEN_EXIT" => Self::FullscreenExit,
            _ => Self::Custom(CustomTag(tag)),
        }
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Custom(CustomTag(tag)) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integrity event as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctorEvent {
    /// Store-assigned id, strictly increasing.
    pub id: EventId,
    /// The attempt the event belongs to.
    pub attempt_id: AttemptId,
    /// The student who produced it.
    pub username: String,
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Opaque detail supplied by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// When the store recorded the event.
    pub created_at: DateTime<Utc>,
}

/// A liveness ping for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// The attempt being worked on.
    pub attempt_id: AttemptId,
    /// The student.
    pub username: String,
    /// Client timestamp, corrected for server clock skew.
    pub ts: DateTime<Utc>,
}
