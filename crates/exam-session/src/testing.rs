//! Scripted in-process session store shared by the unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::attempt::{Attempt, AttemptId, AttemptStatus, ExamId, SubmitKind};
use crate::error::{Result, SessionError};
use crate::exam::{ExamSettings, QuestionKind, QuestionSnapshot};
use crate::proctor::{EventId, Heartbeat, MessageId, MessageKind, ProctorMessage};
use crate::store::{AttemptStart, EventReport, SessionStore, SubmitReceipt, SubmitRequest};

pub const EXAM_ID: ExamId = 1;
pub const ATTEMPT_ID: AttemptId = 100;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
}

pub fn questions() -> Vec<QuestionSnapshot> {
    vec![
        QuestionSnapshot {
            id: 1,
            kind: QuestionKind::SingleChoice,
            stem: "2 + 2 = ?".to_string(),
            options: vec!["3".to_string(), "4".to_string()],
            score: 5,
        },
        QuestionSnapshot {
            id: 2,
            kind: QuestionKind::TrueFalse,
            stem: "A stack is FIFO.".to_string(),
            options: vec!["True".to_string(), "False".to_string()],
            score: 5,
        },
    ]
}

#[derive(Default)]
struct Inner {
    status: AttemptStatus,
    submits: Vec<SubmitRequest>,
    submit_failures: VecDeque<SessionError>,
    heartbeats: Vec<Heartbeat>,
    heartbeat_failures: usize,
    events: Vec<EventReport>,
    event_failures: VecDeque<SessionError>,
    messages: Vec<ProctorMessage>,
    polls: Vec<Option<MessageId>>,
    next_event_id: EventId,
}

/// A fake store with one attempt whose deadline is `minutes` after `t0`.
pub struct ScriptedStore {
    minutes: i64,
    settings: ExamSettings,
    inner: Mutex<Inner>,
}

impl ScriptedStore {
    pub fn new(minutes: i64) -> Self {
        Self::with_settings(minutes, ExamSettings::default())
    }

    pub fn with_settings(minutes: i64, settings: ExamSettings) -> Self {
        Self {
            minutes,
            settings,
            inner: Mutex::new(Inner {
                status: AttemptStatus::NotStarted,
                ..Inner::default()
            }),
        }
    }

    pub fn status(&self) -> AttemptStatus {
        self.inner.lock().unwrap().status
    }

    pub fn submits(&self) -> Vec<SubmitRequest> {
        self.inner.lock().unwrap().submits.clone()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.inner.lock().unwrap().heartbeats.clone()
    }

    pub fn events(&self) -> Vec<EventReport> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn polls(&self) -> Vec<Option<MessageId>> {
        self.inner.lock().unwrap().polls.clone()
    }

    /// Next `n` submits fail with a transient network error.
    pub fn fail_submits(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..n {
            inner.submit_failures.push_back(SessionError::network("connection reset"));
        }
    }

    pub fn fail_heartbeats(&self, n: usize) {
        self.inner.lock().unwrap().heartbeat_failures = n;
    }

    pub fn fail_events(&self, errors: Vec<SessionError>) {
        self.inner.lock().unwrap().event_failures.extend(errors);
    }

    /// Appends a proctor message with the next id. A `ForceSubmit` or
    /// `Reopen` also changes the stored status, as the real store does.
    pub fn push_message(&self, kind: MessageKind, text: &str) -> MessageId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.messages.last().map_or(1, |m| m.id + 1);
        match kind {
            MessageKind::ForceSubmit if inner.status == AttemptStatus::InProgress => {
                inner.status = AttemptStatus::AutoSubmitted;
            }
            MessageKind::Reopen if inner.status.is_terminal() => {
                inner.status = AttemptStatus::InProgress;
            }
            _ => {}
        }
        inner.messages.push(ProctorMessage {
            id,
            kind,
            message: text.to_string(),
            created_at: Utc::now(),
        });
        id
    }
}

#[async_trait]
impl SessionStore for ScriptedStore {
    async fn start_attempt(&self, exam_id: ExamId) -> Result<AttemptStart> {
        let mut inner = self.inner.lock().unwrap();
        inner.status = AttemptStatus::InProgress;
        Ok(AttemptStart {
            attempt: Attempt::started(
                ATTEMPT_ID,
                exam_id,
                7,
                "zhangsan",
                t0(),
                t0() + Duration::minutes(self.minutes),
            ),
            questions: questions(),
            settings: self.settings.clone(),
            server_time: t0(),
        })
    }

    async fn submit_attempt(&self, _exam_id: ExamId, request: &SubmitRequest) -> Result<SubmitReceipt> {
        let mut inner = self.inner.lock().unwrap();
        inner.submits.push(request.clone());
        if let Some(err) = inner.submit_failures.pop_front() {
            return Err(err);
        }
        if inner.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                attempt_id: request.attempt_id,
                status: inner.status,
            });
        }
        inner.status = match request.kind {
            SubmitKind::User => AttemptStatus::Submitted,
            SubmitKind::Auto => AttemptStatus::AutoSubmitted,
        };
        Ok(SubmitReceipt {
            attempt_id: request.attempt_id,
            status: inner.status,
            submitted_at: Some(Utc::now()),
        })
    }

    async fn record_heartbeat(&self, _exam_id: ExamId, heartbeat: &Heartbeat) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.heartbeat_failures > 0 {
            inner.heartbeat_failures -= 1;
            return Err(SessionError::network("heartbeat dropped"));
        }
        inner.heartbeats.push(heartbeat.clone());
        Ok(())
    }

    async fn record_event(&self, _exam_id: ExamId, report: &EventReport) -> Result<EventId> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.event_failures.pop_front() {
            return Err(err);
        }
        inner.next_event_id += 1;
        inner.events.push(report.clone());
        Ok(inner.next_event_id)
    }

    async fn list_messages_since(
        &self,
        _exam_id: ExamId,
        _attempt_id: AttemptId,
        after: Option<MessageId>,
    ) -> Result<Vec<ProctorMessage>> {
        let mut inner = self.inner.lock().unwrap();
        inner.polls.push(after);
        Ok(inner
            .messages
            .iter()
            .filter(|m| after.map_or(true, |seen| m.id > seen))
            .cloned()
            .collect())
    }
}
