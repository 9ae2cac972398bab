//! Error types for the exam session core.
//!
//! This module defines the error hierarchy for every session operation,
//! including configuration loading, attempt validation, state transitions,
//! and calls to the external session store. It also defines the JSON error
//! body shared by the HTTP server and client so that typed failures survive
//! the wire.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::{AttemptId, AttemptStatus, ExamId, QuestionId};

/// A specialized `Result` type for exam session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur while running or observing an exam attempt.
///
/// Variants are grouped by where they originate. Validation errors are
/// surfaced directly to whoever called `start`; transient errors are retried
/// by the background reporters and never reach the exam taker.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in a configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate the file with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Validation Errors (fatal to `start`)
    // ========================================================================
    /// The exam window does not contain the current time.
    #[error("Exam {exam_id} is not open: attempts are accepted from {start_at} to {end_at}, current time is {now}")]
    WindowViolation {
        /// The exam that was requested.
        exam_id: ExamId,
        /// Server time when the request was evaluated.
        now: DateTime<Utc>,
        /// Start of the exam window.
        start_at: DateTime<Utc>,
        /// End of the exam window.
        end_at: DateTime<Utc>,
    },

    /// The student already used every permitted attempt.
    #[error("Attempt limit reached for exam {exam_id}: {limit} attempt(s) allowed")]
    AttemptLimitExceeded {
        /// The exam that was requested.
        exam_id: ExamId,
        /// Maximum attempts allowed by the exam settings.
        limit: u32,
    },

    /// Submitted answers do not match the attempt's question snapshot.
    #[error("Invalid answer for question {question_id}: {message}")]
    InvalidAnswer {
        /// The offending question id.
        question_id: QuestionId,
        /// Why the answer was rejected.
        message: String,
    },

    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// No exam with the given id exists.
    #[error("Exam not found: {exam_id}")]
    ExamNotFound {
        /// The unknown exam id.
        exam_id: ExamId,
    },

    /// No attempt with the given id exists.
    #[error("Attempt not found: {attempt_id}")]
    AttemptNotFound {
        /// The unknown attempt id.
        attempt_id: AttemptId,
    },

    /// The attempt exists but belongs to another exam or student.
    #[error("Attempt {attempt_id} does not belong to the current exam or student")]
    AttemptMismatch {
        /// The attempt that was addressed.
        attempt_id: AttemptId,
    },

    // ========================================================================
    // State Machine Errors
    // ========================================================================
    /// The attempt already reached a terminal state.
    ///
    /// The attempt controller treats this as success-equivalent for submit.
    #[error("Attempt {attempt_id} is already {status}")]
    AlreadyTerminal {
        /// The attempt that was addressed.
        attempt_id: AttemptId,
        /// The terminal status recorded by the store.
        status: AttemptStatus,
    },

    /// Invalid state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The credential attached to the request was missing, expired or invalid.
    ///
    /// Recovery belongs to the embedding application's session-reset path.
    #[error("Unauthorized: {message}\n\nSuggestion: Sign in again to obtain a fresh credential")]
    Unauthorized {
        /// Description from the store.
        message: String,
    },

    /// The store could not be reached.
    #[error("Network error: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
    },

    /// The store rejected the request with a code this client has no
    /// dedicated variant for.
    #[error("Request rejected ({code}): {message}")]
    Rejected {
        /// Machine-readable rejection code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// The store failed while handling the request.
    #[error("Store error (HTTP {status}): {message}")]
    Store {
        /// HTTP status returned by the store.
        status: u16,
        /// Description from the store.
        message: String,
    },

    /// The attempt controller task is no longer running.
    #[error("Attempt controller has shut down")]
    ControllerClosed,

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Creates a new `ConfigParseError`.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError`.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `InvalidAnswer` error.
    #[must_use]
    pub fn invalid_answer(question_id: QuestionId, message: impl Into<String>) -> Self {
        Self::InvalidAnswer {
            question_id,
            message: message.into(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a new `Network` error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is transient and may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Store { status, .. } => *status >= 500 || *status == 429,
            Self::Rejected { code, .. } => matches!(code, ErrorCode::Unavailable),
            _ => false,
        }
    }

    /// Returns `true` if this error is a validation failure that should be
    /// shown to the exam taker as-is.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::WindowViolation { .. }
                | Self::AttemptLimitExceeded { .. }
                | Self::InvalidAnswer { .. }
                | Self::Rejected {
                    code: ErrorCode::WindowViolation
                        | ErrorCode::AttemptLimit
                        | ErrorCode::InvalidAnswer,
                    ..
                }
        )
    }

    /// Returns `true` if this error is fatal and requires immediate termination.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::Unauthorized { .. }
                | Self::ControllerClosed
        )
    }

    /// Returns the machine-readable code used on the wire for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::WindowViolation { .. } => ErrorCode::WindowViolation,
            Self::AttemptLimitExceeded { .. } => ErrorCode::AttemptLimit,
            Self::InvalidAnswer { .. } => ErrorCode::InvalidAnswer,
            Self::ExamNotFound { .. } | Self::AttemptNotFound { .. } => ErrorCode::NotFound,
            Self::AttemptMismatch { .. } => ErrorCode::Forbidden,
            Self::AlreadyTerminal { .. } => ErrorCode::AlreadyTerminal,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidTransition,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Network { .. } | Self::ControllerClosed => ErrorCode::Unavailable,
            Self::Rejected { code, .. } => *code,
            Self::ConfigParseError { .. }
            | Self::ConfigValidationError { .. }
            | Self::Store { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorCode::Internal,
        }
    }

    /// Converts this error into the JSON body sent over HTTP.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let attempt_status = match self {
            Self::AlreadyTerminal { status, .. } => Some(*status),
            _ => None,
        };
        ErrorBody {
            error: self.to_string(),
            code: self.code(),
            attempt_status,
        }
    }

    /// Rebuilds a typed error from an HTTP status and error body.
    ///
    /// `attempt_id` is the attempt the request addressed, if any; it is needed
    /// to rebuild `AlreadyTerminal`.
    #[must_use]
    pub fn from_body(http_status: u16, attempt_id: Option<AttemptId>, body: ErrorBody) -> Self {
        match (body.code, body.attempt_status, attempt_id) {
            (ErrorCode::AlreadyTerminal, Some(status), Some(attempt_id)) => Self::AlreadyTerminal {
                attempt_id,
                status,
            },
            (ErrorCode::Unauthorized, _, _) => Self::unauthorized(body.error),
            (ErrorCode::Internal, _, _) => Self::Store {
                status: http_status,
                message: body.error,
            },
            (code, _, _) => Self::Rejected {
                code,
                message: body.error,
            },
        }
    }
}

// ============================================================================
// Wire Error Body
// ============================================================================

/// Machine-readable error codes shared by server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The exam window does not contain the current time.
    WindowViolation,
    /// The attempt limit was reached.
    AttemptLimit,
    /// The answers did not match the snapshot.
    InvalidAnswer,
    /// The request body or parameters were malformed.
    BadRequest,
    /// The addressed exam or attempt does not exist.
    NotFound,
    /// The attempt belongs to someone else.
    Forbidden,
    /// The attempt is already terminal.
    AlreadyTerminal,
    /// The requested transition is not legal from the current status.
    InvalidTransition,
    /// The credential was missing or invalid.
    Unauthorized,
    /// A collaborator is temporarily unavailable.
    Unavailable,
    /// Unexpected server failure.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WindowViolation => "window_violation",
            Self::AttemptLimit => "attempt_limit",
            Self::InvalidAnswer => "invalid_answer",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::AlreadyTerminal => "already_terminal",
            Self::InvalidTransition => "invalid_transition",
            Self::Unauthorized => "unauthorized",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// JSON error body returned by the session store's HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Human-readable description.
    pub error: String,
    /// Machine-readable code.
    pub code: ErrorCode,
    /// The recorded status, present when `code` is `already_terminal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_status: Option<AttemptStatus>,
}
