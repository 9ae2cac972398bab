//! Exam Session Core
//!
//! Runs a timed, proctored exam attempt against an authoritative session
//! store: the attempt state machine, heartbeats, proctor events, proctor
//! message polling, the teacher's monitor projection and the streamed
//! explanation reader.

pub mod attempt;
pub mod config;
pub mod controller;
pub mod error;
pub mod exam;
pub mod explain;
pub mod feed;
pub mod heartbeat;
pub mod http;
pub mod monitor;
pub mod poller;
pub mod proctor;
pub mod reporter;
pub mod retry;
pub mod store;

#[cfg(test)]
mod testing;

pub use attempt::{
    AnswerRecord, AnswerSheet, Attempt, AttemptId, AttemptStatus, ExamId, PaperId, QuestionId, ReopenGrant,
    SubmitKind, Transition,
};
pub use config::{RetryPolicy, SessionConfig, CONFIG_FILE};
pub use controller::{AttemptController, AttemptHandle};
pub use error::{ErrorBody, ErrorCode, Result, SessionError};
pub use exam::{AnswerVisibility, Exam, ExamSettings, Question, QuestionKind, QuestionSnapshot, StudentIdentity};
pub use explain::{ExplanationStream, StreamError, StreamOutcome, Utf8Decoder};
pub use feed::{AttemptEvent, EventBroadcaster};
pub use heartbeat::HeartbeatEmitter;
pub use http::HttpSessionStore;
pub use monitor::{
    aggregate, EventBrief, MonitorCounts, MonitorQuery, MonitorRecords, MonitorSnapshot, StatusFilter, StudentRow,
    RECENT_EVENT_LIMIT,
};
pub use poller::MessagePoller;
pub use proctor::{CustomTag, EventId, EventKind, Heartbeat, MessageCursor, MessageId, MessageKind, ProctorEvent, ProctorMessage};
pub use reporter::EventReporter;
pub use store::{
    Analysis, AttemptStart, ChatMessage, Credential, EventReceipt, EventReport, Explanation, ExplainRequest,
    MessagesQuery, ProctorConsole, RemindRequest, SessionStore, SubmitReceipt, SubmitRequest,
};
