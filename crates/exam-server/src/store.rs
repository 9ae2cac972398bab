//! In-memory authoritative session store.
//!
//! [`MemoryStore`] owns every attempt, heartbeat, proctor event and proctor
//! message. All mutations go through one async mutex, so the state machine
//! checks and the writes they guard are atomic. Every accepted change is
//! published on the monitor feed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use exam_session::{
    aggregate, AnswerSheet, Attempt, AttemptId, AttemptStart, AttemptStatus, ErrorCode, EventBroadcaster,
    EventReport, Exam, ExamId, Heartbeat, MessageId, MessageKind, MonitorQuery, MonitorRecords, MonitorSnapshot,
    ProctorEvent, ProctorMessage, Question, QuestionId, QuestionSnapshot, ReopenGrant, Result, SessionError,
    SubmitKind, SubmitReceipt, SubmitRequest, Transition,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{ExamDefinition, ServerConfig};
use crate::grading::{grade, ExamResult, ResultItem};
use crate::websocket::MonitorEvent;

/// One attempt with the server-side data that never leaves the store.
#[derive(Debug, Clone)]
struct AttemptRecord {
    attempt: Attempt,
    /// Questions in the order this attempt presents them.
    questions: Vec<Question>,
    answers: AnswerSheet,
    result: Option<ExamResult>,
}

impl AttemptRecord {
    fn owned_by(&self, exam_id: ExamId, username: &str) -> bool {
        self.attempt.exam_id == exam_id && self.attempt.username == username
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    attempt_id: AttemptId,
    message: ProctorMessage,
}

#[derive(Debug, Default)]
struct Records {
    attempts: BTreeMap<AttemptId, AttemptRecord>,
    heartbeats: HashMap<AttemptId, Heartbeat>,
    events: Vec<ProctorEvent>,
    messages: Vec<StoredMessage>,
    last_attempt_id: AttemptId,
    last_event_id: u64,
    last_message_id: MessageId,
}

impl Records {
    fn attempt(&self, attempt_id: AttemptId) -> Result<&AttemptRecord> {
        self.attempts
            .get(&attempt_id)
            .ok_or(SessionError::AttemptNotFound { attempt_id })
    }

    fn attempt_mut(&mut self, attempt_id: AttemptId) -> Result<&mut AttemptRecord> {
        self.attempts
            .get_mut(&attempt_id)
            .ok_or(SessionError::AttemptNotFound { attempt_id })
    }

    /// Looks up an attempt addressed by a student.
    fn owned(&self, exam_id: ExamId, username: &str, attempt_id: AttemptId) -> Result<&AttemptRecord> {
        let record = self.attempt(attempt_id)?;
        if record.owned_by(exam_id, username) {
            Ok(record)
        } else {
            Err(SessionError::AttemptMismatch { attempt_id })
        }
    }

    fn push_message(
        &mut self,
        attempt_id: AttemptId,
        kind: MessageKind,
        text: String,
        now: DateTime<Utc>,
    ) -> ProctorMessage {
        self.last_message_id += 1;
        let message = ProctorMessage {
            id: self.last_message_id,
            kind,
            message: text,
            created_at: now,
        };
        self.messages.push(StoredMessage {
            attempt_id,
            message: message.clone(),
        });
        message
    }
}

/// Everything needed to explain one graded question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplainContext {
    /// Display name of the exam.
    pub exam_name: String,
    /// The question, with its answer key.
    pub question: Question,
    /// How the student did on it.
    pub item: ResultItem,
}

/// The reference session store.
#[derive(Debug)]
pub struct MemoryStore {
    exams: BTreeMap<ExamId, ExamDefinition>,
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    feed: EventBroadcaster<MonitorEvent>,
    records: Mutex<Records>,
}

impl MemoryStore {
    /// Creates an empty store for the exams in `config`.
    #[must_use]
    pub fn new(config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        let exams = config
            .exams
            .iter()
            .map(|d| (d.exam.id, d.clone()))
            .collect();
        let feed = EventBroadcaster::new(config.feed_capacity);
        Self {
            exams,
            config,
            clock,
            feed,
            records: Mutex::new(Records::default()),
        }
    }

    /// The configuration the store was built from.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current store time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The monitor feed.
    #[must_use]
    pub const fn feed(&self) -> &EventBroadcaster<MonitorEvent> {
        &self.feed
    }

    /// Looks up an exam.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ExamNotFound` for unknown ids.
    pub fn exam(&self, exam_id: ExamId) -> Result<&Exam> {
        self.definition(exam_id).map(|d| &d.exam)
    }

    fn definition(&self, exam_id: ExamId) -> Result<&ExamDefinition> {
        self.exams.get(&exam_id).ok_or(SessionError::ExamNotFound { exam_id })
    }

    fn on_roster(&self, username: &str) -> bool {
        self.config.roster.is_empty() || self.config.roster.iter().any(|s| s.username == username)
    }

    /// Returns `true` if `username` may use the teacher routes.
    #[must_use]
    pub fn is_teacher(&self, username: &str) -> bool {
        self.config.teachers.is_empty() || self.config.teachers.iter().any(|t| t == username)
    }

    // ========================================================================
    // Student side
    // ========================================================================

    /// Starts an attempt, or resumes the student's in-progress one.
    ///
    /// # Errors
    ///
    /// - `ExamNotFound` if the exam is unknown or the student is not on the roster
    /// - `WindowViolation` if the exam window does not contain now
    /// - `InvalidStateTransition` if an attempt is in progress and resume is off
    /// - `AttemptLimitExceeded` if every permitted attempt was used
    pub async fn start_attempt(&self, exam_id: ExamId, username: &str) -> Result<AttemptStart> {
        let definition = self.definition(exam_id)?;
        if !self.on_roster(username) {
            return Err(SessionError::ExamNotFound { exam_id });
        }
        let exam = &definition.exam;
        let now = self.clock.now();
        if !exam.is_open_at(now) {
            return Err(SessionError::WindowViolation {
                exam_id,
                now,
                start_at: exam.start_at,
                end_at: exam.end_at,
            });
        }

        let mut records = self.records.lock().await;
        let mine: Vec<&AttemptRecord> = records
            .attempts
            .values()
            .filter(|r| r.owned_by(exam_id, username))
            .collect();

        if let Some(active) = mine.iter().rev().find(|r| r.attempt.status.is_active()) {
            if !exam.settings.allow_resume {
                return Err(SessionError::invalid_transition(
                    AttemptStatus::InProgress,
                    Transition::Start,
                ));
            }
            debug!(attempt_id = active.attempt.id, username, "Resuming attempt");
            return Ok(attempt_start(active, exam, now));
        }

        let limit = exam.settings.attempt_limit;
        if mine.len() >= limit as usize {
            return Err(SessionError::AttemptLimitExceeded { exam_id, limit });
        }

        records.last_attempt_id += 1;
        let attempt_id = records.last_attempt_id;
        let mut questions = definition.questions.clone();
        if exam.settings.shuffle_questions {
            questions.shuffle(&mut StdRng::seed_from_u64(attempt_id));
        }

        let attempt = Attempt::started(
            attempt_id,
            exam_id,
            exam.paper_id,
            username,
            now,
            exam.effective_deadline(now),
        );
        let record = AttemptRecord {
            attempt: attempt.clone(),
            questions,
            answers: AnswerSheet::new(),
            result: None,
        };
        let start = attempt_start(&record, exam, now);
        records.attempts.insert(attempt_id, record);
        drop(records);

        info!(attempt_id, exam_id, username, end_at = %attempt.end_at, "Attempt started");
        self.feed.send(MonitorEvent::attempt_started(attempt));
        Ok(start)
    }

    /// Submits an attempt and grades it.
    ///
    /// A user submit that arrives after the attempt's deadline is recorded
    /// as `AUTO_SUBMITTED`.
    ///
    /// # Errors
    ///
    /// - `AttemptNotFound` / `AttemptMismatch` for unknown or foreign attempts
    /// - `AlreadyTerminal` carrying the recorded status
    /// - `InvalidAnswer` for question ids outside the attempt
    pub async fn submit(&self, exam_id: ExamId, username: &str, request: SubmitRequest) -> Result<SubmitReceipt> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records.owned(exam_id, username, request.attempt_id)?;
        check_answers(record, &request.answers)?;

        let kind = if request.kind == SubmitKind::User && now > record.attempt.end_at {
            SubmitKind::Auto
        } else {
            request.kind
        };

        let record = records.attempt_mut(request.attempt_id)?;
        let attempt = finish(record, request.answers, kind, now)?;
        drop(records);

        info!(attempt_id = attempt.id, status = %attempt.status, "Attempt submitted");
        let receipt = SubmitReceipt {
            attempt_id: attempt.id,
            status: attempt.status,
            submitted_at: attempt.submitted_at,
        };
        self.feed.send(MonitorEvent::attempt_submitted(attempt));
        Ok(receipt)
    }

    /// Records a heartbeat. Only the newest beat per attempt is kept.
    ///
    /// # Errors
    ///
    /// `AttemptNotFound` or `AttemptMismatch`.
    pub async fn record_heartbeat(&self, exam_id: ExamId, username: &str, heartbeat: Heartbeat) -> Result<()> {
        let mut records = self.records.lock().await;
        records.owned(exam_id, username, heartbeat.attempt_id)?;

        let heartbeat = Heartbeat {
            username: username.to_string(),
            ..heartbeat
        };
        let newer = records
            .heartbeats
            .get(&heartbeat.attempt_id)
            .map_or(true, |last| heartbeat.ts > last.ts);
        if !newer {
            debug!(attempt_id = heartbeat.attempt_id, ts = %heartbeat.ts, "Ignoring stale heartbeat");
            return Ok(());
        }
        records.heartbeats.insert(heartbeat.attempt_id, heartbeat.clone());
        drop(records);

        self.feed.send(MonitorEvent::heartbeat(exam_id, heartbeat));
        Ok(())
    }

    /// Appends a proctor event and returns its id.
    ///
    /// # Errors
    ///
    /// `AttemptNotFound` or `AttemptMismatch`.
    pub async fn record_event(&self, exam_id: ExamId, username: &str, report: EventReport) -> Result<u64> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        records.owned(exam_id, username, report.attempt_id)?;

        records.last_event_id += 1;
        let event = ProctorEvent {
            id: records.last_event_id,
            attempt_id: report.attempt_id,
            username: username.to_string(),
            kind: report.kind,
            payload: report.payload,
            created_at: now,
        };
        records.events.push(event.clone());
        drop(records);

        debug!(event_id = event.id, attempt_id = event.attempt_id, kind = %event.kind, "Proctor event recorded");
        let id = event.id;
        self.feed.send(MonitorEvent::proctor_event(exam_id, event));
        Ok(id)
    }

    /// Lists messages for an attempt with id strictly greater than `after`.
    ///
    /// # Errors
    ///
    /// `AttemptNotFound` or `AttemptMismatch`.
    pub async fn list_messages(
        &self,
        exam_id: ExamId,
        username: &str,
        attempt_id: AttemptId,
        after: Option<MessageId>,
    ) -> Result<Vec<ProctorMessage>> {
        let records = self.records.lock().await;
        records.owned(exam_id, username, attempt_id)?;
        Ok(records
            .messages
            .iter()
            .filter(|m| m.attempt_id == attempt_id)
            .filter(|m| after.map_or(true, |after| m.message.id > after))
            .map(|m| m.message.clone())
            .collect())
    }

    /// Resolves the question a student wants explained.
    ///
    /// Uses the student's latest graded attempt of the exam.
    ///
    /// # Errors
    ///
    /// - `Rejected(NotFound)` if the student has no graded attempt
    /// - `Rejected(Forbidden)` while answers are hidden by the exam settings
    /// - `Rejected(BadRequest)` for question id 0
    /// - `Rejected(NotFound)` if the question is not part of the result
    pub async fn explain_context(
        &self,
        exam_id: ExamId,
        username: &str,
        question_id: QuestionId,
    ) -> Result<ExplainContext> {
        let exam = self.exam(exam_id)?;
        let now = self.clock.now();
        let records = self.records.lock().await;
        let record = records
            .attempts
            .values()
            .rev()
            .find(|r| r.owned_by(exam_id, username) && r.result.is_some())
            .ok_or_else(|| SessionError::Rejected {
                code: ErrorCode::NotFound,
                message: format!("no graded attempt of exam {exam_id}"),
            })?;

        if !exam.settings.answers_visible(record.attempt.status, exam.end_at, now) {
            return Err(SessionError::Rejected {
                code: ErrorCode::Forbidden,
                message: "answers are not available yet".to_string(),
            });
        }
        if question_id == 0 {
            return Err(SessionError::Rejected {
                code: ErrorCode::BadRequest,
                message: "questionId must be positive".to_string(),
            });
        }

        let not_found = || SessionError::Rejected {
            code: ErrorCode::NotFound,
            message: format!("question {question_id} is not part of attempt {}", record.attempt.id),
        };
        let item = record
            .result
            .as_ref()
            .and_then(|r| r.item(question_id))
            .ok_or_else(not_found)?;
        let question = record
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .ok_or_else(not_found)?;

        Ok(ExplainContext {
            exam_name: exam.name.clone(),
            question: question.clone(),
            item: item.clone(),
        })
    }

    // ========================================================================
    // Teacher side
    // ========================================================================

    /// Auto-submits an in-progress attempt and tells the student.
    ///
    /// # Errors
    ///
    /// `AttemptNotFound`, or `AlreadyTerminal` if it was already submitted.
    pub async fn force_submit(&self, attempt_id: AttemptId) -> Result<Attempt> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records.attempt_mut(attempt_id)?;
        let attempt = finish(record, AnswerSheet::new(), SubmitKind::Auto, now)?;
        let message = records.push_message(attempt_id, MessageKind::ForceSubmit, String::new(), now);
        drop(records);

        info!(attempt_id, username = %attempt.username, "Attempt force-submitted");
        let exam_id = attempt.exam_id;
        self.feed.send(MonitorEvent::attempt_submitted(attempt.clone()));
        self.feed.send(MonitorEvent::message_sent(exam_id, attempt_id, message));
        Ok(attempt)
    }

    /// Returns a terminal attempt to `IN_PROGRESS` and tells the student.
    ///
    /// The attempt keeps its original deadline, so a reopen is only
    /// accepted while that deadline and the exam window are both ahead.
    ///
    /// # Errors
    ///
    /// - `AttemptNotFound`
    /// - `WindowViolation` once the exam or the attempt deadline has passed
    /// - `InvalidStateTransition` if the attempt is not terminal
    pub async fn reopen(&self, attempt_id: AttemptId) -> Result<Attempt> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records.attempt(attempt_id)?;
        let exam = self.exam(record.attempt.exam_id)?;
        if !exam.is_open_at(now) || now >= record.attempt.end_at {
            return Err(SessionError::WindowViolation {
                exam_id: exam.id,
                now,
                start_at: exam.start_at,
                end_at: exam.end_at.min(record.attempt.end_at),
            });
        }
        let status = record.attempt.status;
        if !status.is_terminal() {
            return Err(SessionError::invalid_transition(status, "IN_PROGRESS (reopen)"));
        }

        let message = records.push_message(attempt_id, MessageKind::Reopen, String::new(), now);
        let grant = ReopenGrant::from_message(&message).ok_or_else(|| {
            SessionError::invalid_transition(status, "IN_PROGRESS (reopen)")
        })?;
        let record = records.attempt_mut(attempt_id)?;
        record.attempt.transition(&Transition::Reopen(grant), now)?;
        record.result = None;
        let attempt = record.attempt.clone();
        drop(records);

        info!(attempt_id, username = %attempt.username, "Attempt reopened");
        let exam_id = attempt.exam_id;
        self.feed.send(MonitorEvent::attempt_reopened(attempt.clone()));
        self.feed.send(MonitorEvent::message_sent(exam_id, attempt_id, message));
        Ok(attempt)
    }

    /// Sends a reminder to the student holding an attempt.
    ///
    /// # Errors
    ///
    /// `AttemptNotFound`, or `Rejected(BadRequest)` for a blank text.
    pub async fn remind(&self, attempt_id: AttemptId, text: &str) -> Result<ProctorMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Rejected {
                code: ErrorCode::BadRequest,
                message: "reminder text cannot be empty".to_string(),
            });
        }

        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let exam_id = records.attempt(attempt_id)?.attempt.exam_id;
        let message = records.push_message(attempt_id, MessageKind::Reminder, text.to_string(), now);
        drop(records);

        info!(attempt_id, message_id = message.id, "Reminder sent");
        self.feed.send(MonitorEvent::message_sent(exam_id, attempt_id, message.clone()));
        Ok(message)
    }

    /// Builds a monitor snapshot for an exam.
    ///
    /// # Errors
    ///
    /// `ExamNotFound`.
    pub async fn monitor(&self, exam_id: ExamId, query: &MonitorQuery) -> Result<MonitorSnapshot> {
        self.exam(exam_id)?;
        let now = self.clock.now();
        let records = self.records.lock().await;

        let exam_attempts: Vec<&AttemptRecord> = records
            .attempts
            .values()
            .filter(|r| r.attempt.exam_id == exam_id)
            .collect();
        let attempts: Vec<Attempt> = exam_attempts.iter().map(|r| r.attempt.clone()).collect();
        let graded = exam_attempts.iter().filter(|r| r.result.is_some()).count();
        let heartbeats: Vec<Heartbeat> = attempts
            .iter()
            .filter_map(|a| records.heartbeats.get(&a.id).cloned())
            .collect();
        let events: Vec<ProctorEvent> = records
            .events
            .iter()
            .filter(|e| records.attempts.get(&e.attempt_id).is_some_and(|r| r.attempt.exam_id == exam_id))
            .cloned()
            .collect();
        drop(records);

        let snapshot = aggregate(
            exam_id,
            &MonitorRecords {
                attempts: &attempts,
                heartbeats: &heartbeats,
                events: &events,
                identities: &self.config.roster,
                graded,
            },
            query,
            now,
        );
        Ok(snapshot)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Auto-submits every in-progress attempt whose exam window closed
    /// before `now`. Returns the ids it submitted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<AttemptId> {
        let mut submitted = Vec::new();
        let mut records = self.records.lock().await;
        for record in records.attempts.values_mut() {
            if !record.attempt.status.is_active() {
                continue;
            }
            let closed = self
                .exams
                .get(&record.attempt.exam_id)
                .is_some_and(|d| now > d.exam.end_at);
            if !closed {
                continue;
            }
            if let Ok(attempt) = finish(record, AnswerSheet::new(), SubmitKind::Auto, now) {
                submitted.push(attempt);
            }
        }
        drop(records);

        for attempt in &submitted {
            info!(attempt_id = attempt.id, exam_id = attempt.exam_id, "Attempt auto-submitted after exam closed");
        }
        let ids = submitted.iter().map(|a| a.id).collect();
        for attempt in submitted {
            self.feed.send(MonitorEvent::attempt_submitted(attempt));
        }
        ids
    }
}

fn attempt_start(record: &AttemptRecord, exam: &Exam, now: DateTime<Utc>) -> AttemptStart {
    AttemptStart {
        attempt: record.attempt.clone(),
        questions: record.questions.iter().map(QuestionSnapshot::capture).collect(),
        settings: exam.settings.clone(),
        server_time: now,
    }
}

fn check_answers(record: &AttemptRecord, answers: &AnswerSheet) -> Result<()> {
    if let Some((question_id, _)) = answers
        .iter()
        .find(|(id, _)| !record.questions.iter().any(|q| q.id == *id))
    {
        return Err(SessionError::invalid_answer(
            question_id,
            format!("question is not part of attempt {}", record.attempt.id),
        ));
    }
    Ok(())
}

/// Moves an in-progress attempt to its terminal status and grades it.
/// Moves an in-progress attempt to its terminal status and grades it.
/// Answers are frozen from then on: `answers` is merged only when the
/// transition happens.
fn finish(record: &mut AttemptRecord, answers: AnswerSheet, kind: SubmitKind, now: DateTime<Utc>) -> Result<Attempt> {
    let status = record.attempt.status;
    if status.is_terminal() {
        return Err(SessionError::AlreadyTerminal {
            attempt_id: record.attempt.id,
            status,
        });
    }
    record.attempt.transition(&kind.transition(), now)?;
    record.answers.merge(answers);
    record.result = Some(grade(record.attempt.id, &record.questions, &record.answers));
    Ok(record.attempt.clone())
}
