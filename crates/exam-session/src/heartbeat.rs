//! Periodic liveness pings for an in-progress attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attempt::{AttemptId, ExamId};
use crate::config::RetryPolicy;
use crate::error::SessionError;
use crate::proctor::Heartbeat;
use crate::retry::{retry_transient, Retried};
use crate::store::SessionStore;

/// Sends one heartbeat per interval until its token is cancelled.
///
/// Delivery is best-effort. A transient failure is retried with backoff until
/// the next tick is due; after that the beat is logged and dropped, and the
/// next tick sends a fresh timestamp.
pub struct HeartbeatEmitter {
    store: Arc<dyn SessionStore>,
    exam_id: ExamId,
    attempt_id: AttemptId,
    username: String,
    interval: Duration,
    skew: chrono::Duration,
    retry: RetryPolicy,
}

impl HeartbeatEmitter {
    /// Creates an emitter. `skew` is added to the local clock so timestamps
    /// line up with the store's clock.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        exam_id: ExamId,
        attempt_id: AttemptId,
        username: impl Into<String>,
        interval: Duration,
        skew: chrono::Duration,
    ) -> Self {
        Self {
            store,
            exam_id,
            attempt_id,
            username: username.into(),
            interval,
            skew,
            retry: RetryPolicy::none(),
        }
    }

    /// Retries transient failures of a beat with `policy`.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Spawns the beat loop. The task resolves to the number of beats the
    /// store accepted.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut accepted = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let beat = Heartbeat {
                attempt_id: self.attempt_id,
                username: self.username.clone(),
                ts: Utc::now() + self.skew,
            };

            let store = &self.store;
            let exam_id = self.exam_id;
            let delivery = retry_transient(&self.retry, &cancel, "record_heartbeat", || {
                store.record_heartbeat(exam_id, &beat)
            });
            let sent = match tokio::time::timeout(self.interval, delivery).await {
                Ok(Retried::Done(sent)) => sent,
                Ok(Retried::Cancelled) => break,
                Err(_) => Err(SessionError::network("heartbeat not delivered before the next beat")),
            };

            match sent {
                Ok(()) => accepted += 1,
                Err(e) => warn!(attempt_id = self.attempt_id, error = %e, "Heartbeat failed"),
            }
        }

        debug!(attempt_id = self.attempt_id, accepted, "Heartbeat emitter stopped");
        accepted
    }
}
