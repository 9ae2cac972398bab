//! Collaborator interfaces of the exam session core.
//!
//! [`SessionStore`] is the authoritative record of attempts as seen by a
//! student. [`ProctorConsole`] is the teacher's side of the same store.
//! [`Analysis`] produces explanations for graded questions. The HTTP client
//! in [`crate::http`] implements all three; tests use scripted fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::{AnswerSheet, Attempt, AttemptId, AttemptStatus, ExamId, QuestionId, SubmitKind};
use crate::error::Result;
use crate::exam::{ExamSettings, QuestionSnapshot};
use crate::explain::ExplanationStream;
use crate::monitor::{MonitorQuery, MonitorSnapshot};
use crate::proctor::{EventId, EventKind, Heartbeat, MessageId, ProctorMessage};

/// Opaque bearer credential supplied by the identity collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

// ============================================================================
// Wire payloads
// ============================================================================

/// Response to a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStart {
    /// The new or resumed attempt.
    pub attempt: Attempt,
    /// Question snapshots in presentation order.
    pub questions: Vec<QuestionSnapshot>,
    /// Exam policy that governs the attempt.
    pub settings: ExamSettings,
    /// Store clock when the response was produced.
    pub server_time: DateTime<Utc>,
}

/// Body of a submit request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// The attempt being submitted.
    pub attempt_id: AttemptId,
    /// Every buffered answer.
    #[serde(default)]
    pub answers: AnswerSheet,
    /// Who initiated the submit.
    pub kind: SubmitKind,
}

/// Store confirmation of a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// The submitted attempt.
    pub attempt_id: AttemptId,
    /// The status the store recorded.
    pub status: AttemptStatus,
    /// When the store recorded it.
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Body of an event report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReport {
    /// The attempt the event belongs to.
    pub attempt_id: AttemptId,
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Opaque detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Store acknowledgement of an event report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReceipt {
    /// The id the store assigned.
    pub event_id: EventId,
}

/// Query string of a message poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    /// The polling attempt.
    pub attempt_id: AttemptId,
    /// Cursor; absent before the first message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<MessageId>,
}

/// One turn of an explanation conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// A request for an explanation of one graded question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainRequest {
    /// The question to explain.
    pub question_id: QuestionId,
    /// Earlier turns, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// A complete, non-streamed explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    /// The explanation text.
    pub content: String,
}

/// Body of a reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemindRequest {
    /// Text shown to the student.
    pub message: String,
}

// ============================================================================
// Traits
// ============================================================================

/// The student-side view of the authoritative session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Starts or resumes an attempt.
    async fn start_attempt(&self, exam_id: ExamId) -> Result<AttemptStart>;

    /// Submits an attempt. Idempotent on the store side.
    async fn submit_attempt(&self, exam_id: ExamId, request: &SubmitRequest) -> Result<SubmitReceipt>;

    /// Records a heartbeat.
    async fn record_heartbeat(&self, exam_id: ExamId, heartbeat: &Heartbeat) -> Result<()>;

    /// Records a proctor event and returns its store-assigned id.
    async fn record_event(&self, exam_id: ExamId, report: &EventReport) -> Result<EventId>;

    /// Lists messages for an attempt with id strictly greater than `after`.
    async fn list_messages_since(
        &self,
        exam_id: ExamId,
        attempt_id: AttemptId,
        after: Option<MessageId>,
    ) -> Result<Vec<ProctorMessage>>;
}

/// The teacher-side controls of the session store.
#[async_trait]
pub trait ProctorConsole: Send + Sync {
    /// Moves an in-progress attempt to `AUTO_SUBMITTED` and tells the student.
    async fn force_submit(&self, attempt_id: AttemptId) -> Result<Attempt>;

    /// Returns a terminal attempt to `IN_PROGRESS` and tells the student.
    async fn reopen(&self, attempt_id: AttemptId) -> Result<Attempt>;

    /// Sends a reminder to the student.
    async fn remind(&self, attempt_id: AttemptId, message: &str) -> Result<ProctorMessage>;

    /// Reads a monitor snapshot for an exam.
    async fn monitor_snapshot(&self, exam_id: ExamId, query: &MonitorQuery) -> Result<MonitorSnapshot>;
}

/// Explanation backend.
#[async_trait]
pub trait Analysis: Send + Sync {
    /// Returns the whole explanation once it is complete.
    async fn explain(&self, exam_id: ExamId, request: &ExplainRequest) -> Result<String>;

    /// Opens a streamed explanation.
    ///
    /// Failures, including a failed initial response, are delivered as the
    /// stream's single error item.
    async fn explain_stream(&self, exam_id: ExamId, request: &ExplainRequest) -> ExplanationStream;
}
