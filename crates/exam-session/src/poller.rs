//! Cursor-based polling of proctor messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attempt::{AttemptId, ExamId};
use crate::error::Result;
use crate::proctor::{MessageCursor, ProctorMessage};
use crate::store::SessionStore;

/// Pulls messages newer than its cursor from the store.
///
/// The cursor only moves forward, and only once a batch has been handed to
/// its consumer, so a batch lost to cancellation is fetched again later.
pub struct MessagePoller {
    store: Arc<dyn SessionStore>,
    exam_id: ExamId,
    attempt_id: AttemptId,
    cursor: MessageCursor,
}

impl MessagePoller {
    /// Creates a poller that has not seen any message.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, exam_id: ExamId, attempt_id: AttemptId) -> Self {
        Self {
            store,
            exam_id,
            attempt_id,
            cursor: MessageCursor::new(),
        }
    }

    /// Creates a poller that resumes after `cursor`.
    #[must_use]
    pub fn with_cursor(
        store: Arc<dyn SessionStore>,
        exam_id: ExamId,
        attempt_id: AttemptId,
        cursor: MessageCursor,
    ) -> Self {
        Self {
            store,
            exam_id,
            attempt_id,
            cursor,
        }
    }

    /// The current cursor.
    #[must_use]
    pub const fn cursor(&self) -> MessageCursor {
        self.cursor
    }

    /// Fetches and consumes every message newer than the cursor.
    ///
    /// # Errors
    ///
    /// Returns the store error; the cursor is left unchanged.
    pub async fn poll_once(&mut self) -> Result<Vec<ProctorMessage>> {
        let messages = self.fetch().await?;
        Ok(self.cursor.accept(messages))
    }

    async fn fetch(&self) -> Result<Vec<ProctorMessage>> {
        self.store
            .list_messages_since(self.exam_id, self.attempt_id, self.cursor.position())
            .await
    }

    /// Spawns the poll loop.
    ///
    /// Each non-empty batch is sent to `tx`. The task hands the poller back
    /// when `cancel` fires or the receiver goes away.
    pub fn spawn<T>(self, interval: Duration, cancel: CancellationToken, tx: mpsc::Sender<T>) -> JoinHandle<Self>
    where
        T: From<Vec<ProctorMessage>> + Send + 'static,
    {
        tokio::spawn(self.run(interval, cancel, tx))
    }

    async fn run<T>(mut self, interval: Duration, cancel: CancellationToken, tx: mpsc::Sender<T>) -> Self
    where
        T: From<Vec<ProctorMessage>> + Send + 'static,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                fetched = self.fetch() => fetched,
            };

            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(attempt_id = self.attempt_id, error = %e, "Message poll failed");
                    continue;
                }
            };

            let mut next = self.cursor;
            let fresh = next.accept(messages);
            if fresh.is_empty() {
                continue;
            }

            let delivered = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = tx.send(T::from(fresh)) => sent.is_ok(),
            };
            if !delivered {
                break;
            }
            self.cursor = next;
        }

        debug!(attempt_id = self.attempt_id, cursor = ?self.cursor.position(), "Message poller stopped");
        self
    }
}
