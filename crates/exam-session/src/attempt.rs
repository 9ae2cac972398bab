//! Attempt state types for the exam session core.
//!
//! This module defines the attempt state machine, the legal transitions
//! between its states, and the local answer buffer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::proctor::{MessageId, MessageKind, ProctorMessage};

/// Identifier of an exam arrangement.
pub type ExamId = u64;
/// Identifier of a paper.
pub type PaperId = u64;
/// Identifier of an attempt.
pub type AttemptId = u64;
/// Identifier of a question.
pub type QuestionId = u64;

// ============================================================================
// AttemptStatus
// ============================================================================

/// Lifecycle status of one exam attempt.
///
/// The status transitions through these states:
/// - `NotStarted` -> `InProgress` (start)
/// - `InProgress` -> `Submitted` (user submit before the deadline)
/// - `InProgress` -> `AutoSubmitted` (deadline, force-submit, leave threshold)
/// - `Submitted` / `AutoSubmitted` -> `InProgress` (server-authorised reopen only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// No attempt has been started yet.
    #[default]
    NotStarted,
    /// The student is answering.
    InProgress,
    /// The student submitted before the deadline.
    Submitted,
    /// The attempt was submitted by the deadline, a proctor, or a policy.
    AutoSubmitted,
}

impl AttemptStatus {
    /// Returns `true` if this status represents a terminal state.
    ///
    /// # Examples
    ///
    /// ```
    /// use exam_session::AttemptStatus;
    ///
    /// assert!(AttemptStatus::Submitted.is_terminal());
    /// assert!(AttemptStatus::AutoSubmitted.is_terminal());
    /// assert!(!AttemptStatus::InProgress.is_terminal());
    /// ```
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Submitted | Self::AutoSubmitted)
    }

    /// Returns `true` while answers may still change.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Applies a transition, returning the resulting status.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidStateTransition` for any edge not listed
    /// on [`AttemptStatus`].
    pub fn apply(self, transition: &Transition) -> Result<Self> {
        match (self, transition) {
            (Self::NotStarted, Transition::Start) => Ok(Self::InProgress),
            (Self::InProgress, Transition::Submit) => Ok(Self::Submitted),
            (Self::InProgress, Transition::AutoSubmit) => Ok(Self::AutoSubmitted),
            (Self::Submitted | Self::AutoSubmitted, Transition::Reopen(_)) => Ok(Self::InProgress),
            (from, transition) => Err(SessionError::invalid_transition(from, transition)),
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Submitted => "SUBMITTED",
            Self::AutoSubmitted => "AUTO_SUBMITTED",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Proof that the session store authorised a reopen.
///
/// The only constructor reads a `REOPEN` proctor message, so client code
/// cannot leave a terminal state on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReopenGrant {
    message_id: MessageId,
}

impl ReopenGrant {
    /// Extracts a grant from a proctor message, if it is a `REOPEN`.
    #[must_use]
    pub fn from_message(message: &ProctorMessage) -> Option<Self> {
        (message.kind == MessageKind::Reopen).then_some(Self {
            message_id: message.id,
        })
    }

    /// The id of the message that authorised the reopen.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message_id
    }
}

/// An attempted edge of the attempt state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Begin answering.
    Start,
    /// User-initiated submit before the deadline.
    Submit,
    /// Submit driven by the deadline, a proctor, or a policy.
    AutoSubmit,
    /// Server-authorised return from a terminal state.
    Reopen(ReopenGrant),
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "IN_PROGRESS (start)"),
            Self::Submit => write!(f, "SUBMITTED"),
            Self::AutoSubmit => write!(f, "AUTO_SUBMITTED"),
            Self::Reopen(grant) => write!(f, "IN_PROGRESS (reopen #{})", grant.message_id),
        }
    }
}

/// How a submit was initiated, as reported to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitKind {
    /// Explicit user action before the deadline.
    User,
    /// Deadline expiry, force-submit, or leave threshold.
    Auto,
}

impl SubmitKind {
    /// The state machine edge this submit corresponds to.
    #[must_use]
    pub const fn transition(self) -> Transition {
        match self {
            Self::User => Transition::Submit,
            Self::Auto => Transition::AutoSubmit,
        }
    }
}

// ============================================================================
// Answers
// ============================================================================

/// One answer as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    /// The answered question.
    pub question_id: QuestionId,
    /// The answer value, opaque to the core.
    pub answer: String,
}

/// The local answer buffer: question id to answer, last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<AnswerRecord>", into = "Vec<AnswerRecord>")]
pub struct AnswerSheet {
    answers: BTreeMap<QuestionId, String>,
}

impl AnswerSheet {
    /// Creates an empty answer sheet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an answer, overwriting any previous value for the question.
    pub fn record(&mut self, question_id: QuestionId, answer: impl Into<String>) {
        self.answers.insert(question_id, answer.into());
    }

    /// Merges every answer of `other` into this sheet.
    pub fn merge(&mut self, other: Self) {
        self.answers.extend(other.answers);
    }

    /// Returns the answer recorded for a question.
    #[must_use]
    pub fn get(&self, question_id: QuestionId) -> Option<&str> {
        self.answers.get(&question_id).map(String::as_str)
    }

    /// Number of answered questions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    /// Returns `true` if nothing was answered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Iterates over `(question_id, answer)` pairs in question id order.
    pub fn iter(&self) -> impl Iterator<Item = (QuestionId, &str)> {
        self.answers.iter().map(|(id, answer)| (*id, answer.as_str()))
    }
}

impl From<Vec<AnswerRecord>> for AnswerSheet {
    fn from(records: Vec<AnswerRecord>) -> Self {
        records
            .into_iter()
            .map(|r| (r.question_id, r.answer))
            .collect()
    }
}

impl From<AnswerSheet> for Vec<AnswerRecord> {
    fn from(sheet: AnswerSheet) -> Self {
        sheet
            .answers
            .into_iter()
            .map(|(question_id, answer)| AnswerRecord {
                question_id,
                answer,
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(QuestionId, S)> for AnswerSheet {
    fn from_iter<I: IntoIterator<Item = (QuestionId, S)>>(iter: I) -> Self {
        let mut sheet = Self::new();
        for (question_id, answer) in iter {
            sheet.record(question_id, answer);
        }
        sheet
    }
}

// ============================================================================
// Attempt
// ============================================================================

/// One student's timed instance of an exam paper.
///
/// `end_at` is fixed when the attempt starts. `submitted_at` is set exactly
/// when the status is terminal; [`Attempt::transition`] keeps both in step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// Store-assigned attempt id.
    pub id: AttemptId,
    /// The exam this attempt belongs to.
    pub exam_id: ExamId,
    /// The paper the questions were taken from.
    pub paper_id: PaperId,
    /// The student taking the attempt.
    pub username: String,
    /// Current lifecycle status.
    pub status: AttemptStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Effective deadline.
    pub end_at: DateTime<Utc>,
    /// When the attempt reached its current terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Attempt {
    /// Creates a started attempt.
    #[must_use]
    pub fn started(
        id: AttemptId,
        exam_id: ExamId,
        paper_id: PaperId,
        username: impl Into<String>,
        started_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            exam_id,
            paper_id,
            username: username.into(),
            status: AttemptStatus::InProgress,
            started_at,
            end_at,
            submitted_at: None,
        }
    }

    /// Returns `true` if the attempt is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a transition at the given time.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidStateTransition` if the edge is illegal;
    /// the attempt is left unchanged in that case.
    pub fn transition(&mut self, transition: &Transition, at: DateTime<Utc>) -> Result<AttemptStatus> {
        let next = self.status.apply(transition)?;
        self.status = next;
        self.submitted_at = next.is_terminal().then_some(at);
        Ok(next)
    }
}

// ============================================================================
// Tests
// ============================================================================
