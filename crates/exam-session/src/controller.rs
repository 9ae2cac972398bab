//! The attempt controller.
//!
//! One controller task owns an attempt's status and answer buffer. Every
//! change goes through its command queue, so a user submit, the countdown,
//! a force-submit message and the leave timer are serialized: the first one
//! processed performs the terminal transition and the others observe it.
//!
//! While the attempt is in progress the controller runs a countdown, a
//! heartbeat emitter and a message poller under one cancellation token (the
//! group token). Reaching a terminal state cancels the group; a reopen
//! starts a fresh one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use exam_session::{AttemptController, HttpSessionStore, Credential, SessionConfig};
//!
//! # async fn example() -> exam_session::Result<()> {
//! let store = Arc::new(HttpSessionStore::new("http://localhost:8080", Credential::bearer("zhangsan"))?);
//! let controller = AttemptController::new(store, SessionConfig::default());
//! let mut feed = controller.subscribe();
//!
//! let handle = controller.start(1).await?;
//! handle.record_answer(handle.questions()[0].id, "B").await?;
//! let status = handle.submit(Default::default()).await?;
//! println!("{status}");
//! # drop(feed.try_recv());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attempt::{AnswerSheet, Attempt, AttemptId, AttemptStatus, ExamId, QuestionId, ReopenGrant, SubmitKind, Transition};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::exam::{ExamSettings, QuestionSnapshot};
use crate::feed::{AttemptEvent, EventBroadcaster};
use crate::heartbeat::HeartbeatEmitter;
use crate::poller::MessagePoller;
use crate::proctor::{EventKind, MessageCursor, MessageKind, ProctorMessage};
use crate::reporter::EventReporter;
use crate::retry::retry_transient;
use crate::store::{SessionStore, SubmitRequest};

/// Capacity of the controller's command queue.
const COMMAND_QUEUE: usize = 64;

// ============================================================================
// Controller
// ============================================================================

/// Starts attempts and owns their notification feed.
pub struct AttemptController {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    feed: EventBroadcaster<AttemptEvent>,
    root: CancellationToken,
}

impl AttemptController {
    /// Creates a controller backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        let feed = EventBroadcaster::new(config.feed_capacity);
        Self {
            store,
            config,
            feed,
            root: CancellationToken::new(),
        }
    }

    /// Subscribes to attempt notifications, including the `started` event
    /// published by [`AttemptController::start`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AttemptEvent> {
        self.feed.subscribe()
    }

    /// Starts or resumes an attempt and spawns its controller task.
    ///
    /// # Errors
    ///
    /// Returns the store's validation error (window violation, attempt limit)
    /// unchanged, or `AlreadyTerminal` if the store handed back an attempt
    /// that is no longer in progress.
    pub async fn start(&self, exam_id: ExamId) -> Result<AttemptHandle> {
        let start = self.store.start_attempt(exam_id).await?;
        let attempt = start.attempt;
        if attempt.status != AttemptStatus::InProgress {
            return Err(SessionError::AlreadyTerminal {
                attempt_id: attempt.id,
                status: attempt.status,
            });
        }

        let skew = start.server_time - Utc::now();
        let remaining = (attempt.end_at - start.server_time)
            .to_std()
            .unwrap_or_default();
        let deadline = Instant::now() + remaining;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(attempt.status);

        info!(
            attempt_id = attempt.id,
            exam_id,
            end_at = %attempt.end_at,
            remaining_secs = remaining.as_secs(),
            "Attempt in progress"
        );

        let info = Arc::new(AttemptInfo {
            exam_id,
            attempt_id: attempt.id,
            end_at: attempt.end_at,
            questions: start.questions,
            settings: start.settings,
        });

        // Shutting one attempt down leaves its siblings running
        let root = self.root.child_token();
        let reporter = EventReporter::new(
            self.store.clone(),
            exam_id,
            attempt.id,
            self.config.event_retry,
            root.clone(),
        );

        let mut actor = Actor {
            store: self.store.clone(),
            config: self.config.clone(),
            info: info.clone(),
            question_ids: info.questions.iter().map(|q| q.id).collect(),
            attempt,
            answers: AnswerSheet::new(),
            skew,
            deadline,
            deadline_passed: false,
            generation: 0,
            leave_generation: 0,
            cursor: MessageCursor::new(),
            group: root.child_token(),
            root: root.clone(),
            leave_timer: None,
            heartbeat: None,
            reporter,
            feed: self.feed.clone(),
            status_tx,
            tx: tx.downgrade(),
            rx,
        };
        actor.start_background();
        self.feed
            .send(AttemptEvent::started(info.attempt_id, info.end_at));
        tokio::spawn(actor.run());

        Ok(AttemptHandle {
            info,
            tx,
            status: status_rx,
            feed: self.feed.clone(),
            root,
        })
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Debug)]
struct AttemptInfo {
    exam_id: ExamId,
    attempt_id: AttemptId,
    end_at: DateTime<Utc>,
    questions: Vec<QuestionSnapshot>,
    settings: ExamSettings,
}

/// Client-side handle to a running attempt.
#[derive(Clone)]
pub struct AttemptHandle {
    info: Arc<AttemptInfo>,
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<AttemptStatus>,
    feed: EventBroadcaster<AttemptEvent>,
    root: CancellationToken,
}

impl AttemptHandle {
    /// The attempt id.
    #[must_use]
    pub fn attempt_id(&self) -> AttemptId {
        self.info.attempt_id
    }

    /// The exam id.
    #[must_use]
    pub fn exam_id(&self) -> ExamId {
        self.info.exam_id
    }

    /// The effective deadline.
    #[must_use]
    pub fn end_at(&self) -> DateTime<Utc> {
        self.info.end_at
    }

    /// Question snapshots in presentation order.
    #[must_use]
    pub fn questions(&self) -> &[QuestionSnapshot] {
        &self.info.questions
    }

    /// The exam policy for this attempt.
    #[must_use]
    pub fn settings(&self) -> &ExamSettings {
        &self.info.settings
    }

    /// The current status.
    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        *self.status.borrow()
    }

    /// Waits until the attempt is terminal and returns that status.
    ///
    /// # Errors
    ///
    /// Returns `ControllerClosed` if the controller stops first.
    pub async fn wait_until_terminal(&self) -> Result<AttemptStatus> {
        let mut status = self.status.clone();
        let seen = status
            .wait_for(AttemptStatus::is_terminal)
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        Ok(*seen)
    }

    /// Subscribes to attempt notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AttemptEvent> {
        self.feed.subscribe()
    }

    /// Buffers an answer, replacing any earlier one for the question.
    ///
    /// # Errors
    ///
    /// Fails once the attempt is terminal or if the question is not part of
    /// the attempt.
    pub async fn record_answer(&self, question_id: QuestionId, answer: impl Into<String>) -> Result<()> {
        self.request(|reply| Command::RecordAnswer {
            question_id,
            answer: answer.into(),
            reply,
        })
        .await?
    }

    /// Returns a copy of the answer buffer.
    pub async fn answers(&self) -> Result<AnswerSheet> {
        self.request(|reply| Command::Answers { reply }).await
    }

    /// Merges `answers` into the buffer and submits.
    ///
    /// Before the deadline this is a user submit (`SUBMITTED`); after it, an
    /// automatic one (`AUTO_SUBMITTED`). Once terminal, returns the recorded
    /// status without contacting the store.
    ///
    /// # Errors
    ///
    /// Returns the store error if the submit still fails after its retries;
    /// the attempt then stays in progress.
    pub async fn submit(&self, answers: AnswerSheet) -> Result<AttemptStatus> {
        self.request(|reply| Command::Submit { answers, reply })
            .await?
    }

    /// Reports a proctor event without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns `ControllerClosed` if the controller has stopped.
    pub async fn report(&self, kind: EventKind, payload: Option<String>) -> Result<()> {
        self.tx
            .send(Command::Report { kind, payload })
            .await
            .map_err(|_| SessionError::ControllerClosed)
    }

    /// Polls proctor messages once, even when the attempt is terminal.
    ///
    /// This is how a reopen is picked up after submission.
    pub async fn refresh(&self) -> Result<AttemptStatus> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    /// Stops the controller and every background activity.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)
    }
}

impl std::fmt::Debug for AttemptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptHandle")
            .field("attempt_id", &self.info.attempt_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    RecordAnswer {
        question_id: QuestionId,
        answer: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Answers {
        reply: oneshot::Sender<AnswerSheet>,
    },
    Submit {
        answers: AnswerSheet,
        reply: oneshot::Sender<Result<AttemptStatus>>,
    },
    Report {
        kind: EventKind,
        payload: Option<String>,
    },
    Refresh {
        reply: oneshot::Sender<Result<AttemptStatus>>,
    },
    Messages(Vec<ProctorMessage>),
    Deadline {
        generation: u64,
    },
    LeaveExpired {
        generation: u64,
    },
}

impl From<Vec<ProctorMessage>> for Command {
    fn from(messages: Vec<ProctorMessage>) -> Self {
        Self::Messages(messages)
    }
}

struct Actor {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    info: Arc<AttemptInfo>,
    question_ids: HashSet<QuestionId>,
    attempt: Attempt,
    answers: AnswerSheet,
    skew: chrono::Duration,
    deadline: Instant,
    deadline_passed: bool,
    /// Bumped every time the group restarts; stale timer commands carry an
    /// older value.
    generation: u64,
    leave_generation: u64,
    cursor: MessageCursor,
    root: CancellationToken,
    group: CancellationToken,
    leave_timer: Option<CancellationToken>,
    heartbeat: Option<JoinHandle<u64>>,
    reporter: EventReporter,
    feed: EventBroadcaster<AttemptEvent>,
    status_tx: watch::Sender<AttemptStatus>,
    tx: mpsc::WeakSender<Command>,
    rx: mpsc::Receiver<Command>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                biased;
                () = self.root.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        self.stop_background().await;
        debug!(attempt_id = self.attempt.id, status = %self.attempt.status, "Attempt controller stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::RecordAnswer {
                question_id,
                answer,
                reply,
            } => {
                let _ = reply.send(self.record_answer(question_id, answer));
            }
            Command::Answers { reply } => {
                let _ = reply.send(self.answers.clone());
            }
            Command::Submit { answers, reply } => {
                let result = if self.attempt.is_terminal() {
                    Ok(self.attempt.status)
                } else {
                    self.answers.merge(answers);
                    let kind = if self.deadline_passed || Instant::now() >= self.deadline {
                        SubmitKind::Auto
                    } else {
                        SubmitKind::User
                    };
                    self.submit(kind).await
                };
                let _ = reply.send(result);
            }
            Command::Report { kind, payload } => self.report(kind, payload),
            Command::Refresh { reply } => {
                let result = self.refresh().await;
                let _ = reply.send(result);
            }
            Command::Messages(messages) => self.handle_messages(messages).await,
            Command::Deadline { generation } => {
                if generation == self.generation && self.attempt.status.is_active() {
                    self.on_deadline().await;
                }
            }
            Command::LeaveExpired { generation } => {
                if generation == self.leave_generation && self.attempt.status.is_active() {
                    info!(attempt_id = self.attempt.id, "Leave threshold exceeded, submitting");
                    self.leave_timer = None;
                    if let Err(e) = self.submit(SubmitKind::Auto).await {
                        warn!(attempt_id = self.attempt.id, error = %e, "Leave auto-submit failed");
                    }
                }
            }
        }
    }

    fn record_answer(&mut self, question_id: QuestionId, answer: String) -> Result<()> {
        if self.attempt.is_terminal() {
            return Err(SessionError::invalid_transition(
                self.attempt.status,
                "record answer",
            ));
        }
        if !self.question_ids.contains(&question_id) {
            return Err(SessionError::invalid_answer(
                question_id,
                "question is not part of this attempt",
            ));
        }
        self.answers.record(question_id, answer);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------------

    async fn submit(&mut self, kind: SubmitKind) -> Result<AttemptStatus> {
        let request = SubmitRequest {
            attempt_id: self.attempt.id,
            answers: self.answers.clone(),
            kind,
        };
        let store = self.store.clone();
        let exam_id = self.info.exam_id;

        let outcome = retry_transient(&self.config.submit_retry, &self.root, "submit_attempt", || {
            store.submit_attempt(exam_id, &request)
        })
        .await
        .into_result();

        match outcome {
            Ok(receipt) => self.enter_terminal(receipt.status, receipt.submitted_at).await,
            // Someone else got there first; adopt the store's status
            Err(SessionError::AlreadyTerminal { status, .. }) => self.enter_terminal(status, None).await,
            Err(e) => {
                warn!(attempt_id = self.attempt.id, ?kind, error = %e, "Submit failed");
                self.feed
                    .send(AttemptEvent::submit_failed(self.attempt.id, e.to_string()));
                Err(e)
            }
        }
    }

    async fn enter_terminal(
        &mut self,
        status: AttemptStatus,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<AttemptStatus> {
        let transition = match status {
            AttemptStatus::Submitted => Transition::Submit,
            AttemptStatus::AutoSubmitted => Transition::AutoSubmit,
            other => return Err(SessionError::invalid_transition(self.attempt.status, other)),
        };
        self.attempt
            .transition(&transition, submitted_at.unwrap_or_else(Utc::now))?;

        self.stop_background().await;
        self.status_tx.send_replace(status);
        self.feed.send(AttemptEvent::submitted(self.attempt.id, status));
        info!(attempt_id = self.attempt.id, %status, "Attempt submitted");
        Ok(status)
    }

    async fn on_deadline(&mut self) {
        self.deadline_passed = true;
        let auto_submit = self.info.settings.auto_submit_on_timeout;
        self.feed
            .send(AttemptEvent::deadline_reached(self.attempt.id, auto_submit));

        if !auto_submit {
            info!(attempt_id = self.attempt.id, "Deadline reached, auto-submit disabled");
            return;
        }

        info!(attempt_id = self.attempt.id, "Deadline reached, submitting");
        if let Err(e) = self.submit(SubmitKind::Auto).await {
            // Not re-armed; the next submit call is classified as automatic
            warn!(attempt_id = self.attempt.id, error = %e, "Deadline auto-submit failed");
        }
    }

    // ------------------------------------------------------------------------
    // Proctor messages
    // ------------------------------------------------------------------------

    async fn refresh(&mut self) -> Result<AttemptStatus> {
        if self.attempt.is_terminal() {
            let mut poller = MessagePoller::with_cursor(
                self.store.clone(),
                self.info.exam_id,
                self.attempt.id,
                self.cursor,
            );
            let messages = poller.poll_once().await?;
            self.handle_messages(messages).await;
        }
        Ok(self.attempt.status)
    }

    async fn handle_messages(&mut self, messages: Vec<ProctorMessage>) {
        let messages = self.cursor.accept(messages);
        // A reopen later in the batch means the store has already moved past
        // this force-submit; submitting again would undo the reopen
        let last_reopen = messages
            .iter()
            .rposition(|m| m.kind == MessageKind::Reopen);

        for (index, message) in messages.into_iter().enumerate() {
            debug!(attempt_id = self.attempt.id, message_id = message.id, kind = %message.kind, "Proctor message");
            match message.kind {
                MessageKind::Reminder => {
                    self.feed
                        .send(AttemptEvent::reminder(message.id, message.message));
                }
                MessageKind::ForceSubmit => {
                    if !self.attempt.status.is_active() {
                        continue;
                    }
                    info!(attempt_id = self.attempt.id, "Force-submit received");
                    if last_reopen.is_some_and(|reopen| reopen > index) {
                        if let Err(e) = self
                            .enter_terminal(AttemptStatus::AutoSubmitted, Some(message.created_at))
                            .await
                        {
                            warn!(attempt_id = self.attempt.id, error = %e, "Force-submit failed");
                        }
                    } else if let Err(e) = self.submit(SubmitKind::Auto).await {
                        warn!(attempt_id = self.attempt.id, error = %e, "Force-submit failed");
                    }
                }
                MessageKind::Reopen => {
                    if let Some(grant) = ReopenGrant::from_message(&message) {
                        self.reopen(grant);
                    }
                }
            }
        }
    }

    fn reopen(&mut self, grant: ReopenGrant) {
        if let Err(e) = self.attempt.transition(&Transition::Reopen(grant), Utc::now()) {
            debug!(attempt_id = self.attempt.id, error = %e, "Ignoring reopen");
            return;
        }

        info!(attempt_id = self.attempt.id, message_id = grant.message_id(), "Attempt reopened");
        self.deadline_passed = false;
        self.group = self.root.child_token();
        self.start_background();
        self.status_tx.send_replace(self.attempt.status);
        self.feed
            .send(AttemptEvent::reopened(self.attempt.id, self.attempt.end_at));
    }

    // ------------------------------------------------------------------------
    // Proctor events
    // ------------------------------------------------------------------------

    fn report(&mut self, kind: EventKind, payload: Option<String>) {
        if !self.attempt.status.is_active() {
            debug!(attempt_id = self.attempt.id, %kind, "Dropping event for inactive attempt");
            return;
        }
        let settings = &self.info.settings;
        if kind.is_tab_switch() && !settings.record_tab_switch {
            return;
        }

        if let Some(seconds) = settings.force_submit_on_leave_seconds {
            if kind.is_leave() && self.leave_timer.is_none() {
                self.arm_leave_timer(u64::from(seconds));
            } else if kind.is_return() {
                self.disarm_leave_timer();
            }
        }

        drop(self.reporter.report(kind, payload));
    }

    fn arm_leave_timer(&mut self, seconds: u64) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.leave_generation += 1;
        let generation = self.leave_generation;
        let token = self.group.child_token();
        self.leave_timer = Some(token.clone());

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(std::time::Duration::from_secs(seconds)) => {
                    let _ = tx.send(Command::LeaveExpired { generation }).await;
                }
            }
        });
    }

    fn disarm_leave_timer(&mut self) {
        if let Some(token) = self.leave_timer.take() {
            token.cancel();
            self.leave_generation += 1;
        }
    }

    // ------------------------------------------------------------------------
    // Background activities
    // ------------------------------------------------------------------------

    fn start_background(&mut self) {
        self.generation += 1;
        let Some(tx) = self.tx.upgrade() else {
            return;
        };

        let generation = self.generation;
        let deadline = self.deadline;
        let countdown_tx = tx.clone();
        let group = self.group.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = group.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    let _ = countdown_tx.send(Command::Deadline { generation }).await;
                }
            }
        });

        if self.info.settings.enable_heartbeat {
            let emitter = HeartbeatEmitter::new(
                self.store.clone(),
                self.info.exam_id,
                self.attempt.id,
                self.attempt.username.clone(),
                self.config.heartbeat_interval(),
                self.skew,
            )
            .with_retry(self.config.heartbeat_retry);
            self.heartbeat = Some(emitter.spawn(self.group.clone()));
        }

        let poller = MessagePoller::with_cursor(
            self.store.clone(),
            self.info.exam_id,
            self.attempt.id,
            self.cursor,
        );
        drop(poller.spawn(self.config.poll_interval(), self.group.clone(), tx));
    }

    async fn stop_background(&mut self) {
        self.group.cancel();
        self.leave_timer = None;
        if let Some(heartbeat) = self.heartbeat.take() {
            if let Ok(beats) = heartbeat.await {
                debug!(attempt_id = self.attempt.id, beats, "Heartbeats stopped");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{ScriptedStore, EXAM_ID};

    fn config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval_secs: 15,
            poll_interval_secs: 5,
            ..SessionConfig::default()
        }
    }

    async fn start(store: &Arc<ScriptedStore>) -> (AttemptHandle, broadcast::Receiver<AttemptEvent>) {
        let controller = AttemptController::new(store.clone(), config());
        let feed = controller.subscribe();
        let handle = controller.start(EXAM_ID).await.unwrap();
        (handle, feed)
    }

    fn drain(feed: &mut broadcast::Receiver<AttemptEvent>) -> Vec<AttemptEvent> {
        let mut events = Vec::new();
        while let Ok(event) = feed.try_recv() {
            events.push(event);
        }
        events
    }

    fn submitted_events(events: &[AttemptEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, AttemptEvent::Submitted(_)))
            .count()
    }

    // ------------------------------------------------------------------------
    // Start and answers
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_start_publishes_started() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, mut feed) = start(&store).await;

        assert_eq!(handle.status(), AttemptStatus::InProgress);
        assert_eq!(handle.questions().len(), 2);
        assert!(matches!(feed.recv().await.unwrap(), AttemptEvent::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_answer_overwrites() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;

        handle.record_answer(1, "3").await.unwrap();
        handle.record_answer(1, "4").await.unwrap();

        let answers = handle.answers().await.unwrap();
        assert_eq!(answers.get(1), Some("4"));
        assert_eq!(answers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_answer_rejects_unknown_question() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;

        let err = handle.record_answer(99, "A").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidAnswer { question_id: 99, .. }));
    }

    // ------------------------------------------------------------------------
    // Submit
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_submit_is_idempotent() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, mut feed) = start(&store).await;
        handle.record_answer(1, "4").await.unwrap();

        let first = handle.submit([(2, "False")].into_iter().collect()).await.unwrap();
        let second = handle.submit(AnswerSheet::new()).await.unwrap();

        assert_eq!(first, AttemptStatus::Submitted);
        assert_eq!(second, AttemptStatus::Submitted);
        let submits = store.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].kind, SubmitKind::User);
        assert_eq!(submits[0].answers.len(), 2);
        assert_eq!(submitted_events(&drain(&mut feed)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_answer_after_terminal_fails() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;
        handle.submit(AnswerSheet::new()).await.unwrap();

        let err = handle.record_answer(1, "4").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidStateTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_failure_keeps_attempt_in_progress() {
        let store = Arc::new(ScriptedStore::new(30));
        store.fail_submits(10);
        let (handle, mut feed) = start(&store).await;

        let err = handle.submit(AnswerSheet::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(handle.status(), AttemptStatus::InProgress);
        assert_eq!(store.submits().len(), config().submit_retry.max_attempts as usize);
        assert!(drain(&mut feed)
            .iter()
            .any(|e| matches!(e, AttemptEvent::SubmitFailed(_))));
    }

    // ------------------------------------------------------------------------
    // Deadline
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_deadline_auto_submits_once() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, mut feed) = start(&store).await;
        handle.record_answer(2, "True").await.unwrap();

        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;

        assert_eq!(handle.wait_until_terminal().await.unwrap(), AttemptStatus::AutoSubmitted);
        let submits = store.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].kind, SubmitKind::Auto);
        assert_eq!(submits[0].answers.get(2), Some("True"));

        let events = drain(&mut feed);
        assert!(events.contains(&AttemptEvent::deadline_reached(handle.attempt_id(), true)));
        assert_eq!(submitted_events(&events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_submit_retried_after_failure() {
        let store = Arc::new(ScriptedStore::new(30));
        store.fail_submits(1);
        let (handle, mut feed) = start(&store).await;

        tokio::time::sleep(Duration::from_secs(30 * 60 + 5)).await;

        assert_eq!(handle.wait_until_terminal().await.unwrap(), AttemptStatus::AutoSubmitted);
        assert_eq!(store.submits().len(), 2);
        assert_eq!(submitted_events(&drain(&mut feed)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_without_auto_submit_only_notifies() {
        let settings = ExamSettings {
            auto_submit_on_timeout: false,
            ..ExamSettings::default()
        };
        let store = Arc::new(ScriptedStore::with_settings(30, settings));
        let (handle, mut feed) = start(&store).await;

        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;
        assert_eq!(handle.status(), AttemptStatus::InProgress);
        assert!(store.submits().is_empty());
        assert!(drain(&mut feed).contains(&AttemptEvent::deadline_reached(handle.attempt_id(), false)));

        // Past the deadline, a manual submit counts as automatic
        let status = handle.submit(AnswerSheet::new()).await.unwrap();
        assert_eq!(status, AttemptStatus::AutoSubmitted);
    }

    // ------------------------------------------------------------------------
    // Proctor messages
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_force_submit_message() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;
        handle.record_answer(1, "3").await.unwrap();

        store.push_message(MessageKind::ForceSubmit, "");
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(handle.wait_until_terminal().await.unwrap(), AttemptStatus::AutoSubmitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_surfaces_on_feed() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, mut feed) = start(&store).await;

        let id = store.push_message(MessageKind::Reminder, "Ten minutes left");
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(drain(&mut feed).contains(&AttemptEvent::reminder(id, "Ten minutes left".to_string())));
        assert_eq!(handle.status(), AttemptStatus::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_restarts_background() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, mut feed) = start(&store).await;
        handle.submit(AnswerSheet::new()).await.unwrap();

        store.push_message(MessageKind::Reopen, "");
        assert_eq!(handle.refresh().await.unwrap(), AttemptStatus::InProgress);
        assert_eq!(handle.status(), AttemptStatus::InProgress);
        assert!(drain(&mut feed)
            .iter()
            .any(|e| matches!(e, AttemptEvent::Reopened(_))));

        // The countdown runs again against the original deadline
        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;
        assert_eq!(handle.wait_until_terminal().await.unwrap(), AttemptStatus::AutoSubmitted);
        assert_eq!(store.submits().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_submit_then_reopen_in_one_batch() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, mut feed) = start(&store).await;
        handle.record_answer(1, "4").await.unwrap();

        store.push_message(MessageKind::ForceSubmit, "");
        store.push_message(MessageKind::Reopen, "");
        tokio::time::sleep(Duration::from_secs(6)).await;

        // The store already reopened; no submit may re-terminate it
        assert!(store.submits().is_empty());
        assert_eq!(store.status(), AttemptStatus::InProgress);
        assert_eq!(handle.status(), AttemptStatus::InProgress);

        let events = drain(&mut feed);
        assert!(events.contains(&AttemptEvent::submitted(handle.attempt_id(), AttemptStatus::AutoSubmitted)));
        assert!(events.iter().any(|e| matches!(e, AttemptEvent::Reopened(_))));

        // The buffer survives the round trip and the attempt can finish
        assert_eq!(handle.answers().await.unwrap().get(1), Some("4"));
        assert_eq!(handle.submit(AnswerSheet::new()).await.unwrap(), AttemptStatus::Submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_submit_adopts_store_status() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;

        // Terminal on the store before the client has polled
        store.push_message(MessageKind::ForceSubmit, "");
        let status = handle.submit(AnswerSheet::new()).await.unwrap();

        assert_eq!(status, AttemptStatus::AutoSubmitted);
        assert_eq!(handle.status(), AttemptStatus::AutoSubmitted);
        assert_eq!(store.status(), AttemptStatus::AutoSubmitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_while_active_does_not_reopen() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;

        assert_eq!(handle.refresh().await.unwrap(), AttemptStatus::InProgress);
    }

    // ------------------------------------------------------------------------
    // Heartbeats and events
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_stop_after_submit() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        handle.submit(AnswerSheet::new()).await.unwrap();
        let beats = store.heartbeats().len();
        assert!(beats >= 3);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.heartbeats().len(), beats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_disabled() {
        let settings = ExamSettings {
            enable_heartbeat: false,
            ..ExamSettings::default()
        };
        let store = Arc::new(ScriptedStore::with_settings(30, settings));
        let (_handle, _feed) = start(&store).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.heartbeats().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tab_switch_recording_disabled() {
        let settings = ExamSettings {
            record_tab_switch: false,
            ..ExamSettings::default()
        };
        let store = Arc::new(ScriptedStore::with_settings(30, settings));
        let (handle, _feed) = start(&store).await;

        handle.report(EventKind::WindowBlur, None).await.unwrap();
        handle.report(EventKind::FullscreenExit, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::FullscreenExit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_threshold_auto_submits() {
        let settings = ExamSettings {
            force_submit_on_leave_seconds: Some(10),
            ..ExamSettings::default()
        };
        let store = Arc::new(ScriptedStore::with_settings(30, settings));
        let (handle, _feed) = start(&store).await;

        handle.report(EventKind::WindowBlur, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(handle.wait_until_terminal().await.unwrap(), AttemptStatus::AutoSubmitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returning_cancels_leave_timer() {
        let settings = ExamSettings {
            force_submit_on_leave_seconds: Some(10),
            ..ExamSettings::default()
        };
        let store = Arc::new(ScriptedStore::with_settings(30, settings));
        let (handle, _feed) = start(&store).await;

        handle.report(EventKind::VisibilityHidden, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.report(EventKind::VisibilityVisible, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(handle.status(), AttemptStatus::InProgress);
        assert!(store.submits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_per_attempt() {
        let store = Arc::new(ScriptedStore::new(30));
        let controller = AttemptController::new(store.clone(), config());
        let first = controller.start(EXAM_ID).await.unwrap();
        let second = controller.start(EXAM_ID).await.unwrap();

        first.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = first.record_answer(1, "4").await.unwrap_err();
        assert!(matches!(err, SessionError::ControllerClosed));
        second.record_answer(1, "4").await.unwrap();
        assert_eq!(second.status(), AttemptStatus::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_controller() {
        let store = Arc::new(ScriptedStore::new(30));
        let (handle, _feed) = start(&store).await;

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = handle.record_answer(1, "4").await.unwrap_err();
        assert!(matches!(err, SessionError::ControllerClosed));
    }
}
