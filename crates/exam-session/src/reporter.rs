//! Fire-and-forget delivery of proctor events.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attempt::{AttemptId, ExamId};
use crate::config::RetryPolicy;
use crate::proctor::{EventId, EventKind};
use crate::retry::{retry_transient, Retried};
use crate::store::{EventReport, SessionStore};

/// Reports integrity events for one attempt.
///
/// Each report runs on its own task so the caller never waits. Transient
/// failures are retried with bounded backoff; after that the event is
/// dropped and logged.
#[derive(Clone)]
pub struct EventReporter {
    store: Arc<dyn SessionStore>,
    exam_id: ExamId,
    attempt_id: AttemptId,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl EventReporter {
    /// Creates a reporter whose in-flight deliveries stop when `cancel` fires.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        exam_id: ExamId,
        attempt_id: AttemptId,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            exam_id,
            attempt_id,
            policy,
            cancel,
        }
    }

    /// Queues an event for delivery and returns immediately.
    ///
    /// The handle resolves to the store-assigned id, or `None` if the event
    /// was dropped. Callers are free to ignore it.
    pub fn report(&self, kind: EventKind, payload: Option<String>) -> JoinHandle<Option<EventId>> {
        let reporter = self.clone();
        let report = EventReport {
            attempt_id: self.attempt_id,
            kind,
            payload,
        };
        tokio::spawn(async move { reporter.deliver(report).await })
    }

    async fn deliver(self, report: EventReport) -> Option<EventId> {
        let outcome = retry_transient(&self.policy, &self.cancel, "record_event", || {
            self.store.record_event(self.exam_id, &report)
        })
        .await;

        match outcome {
            Retried::Done(Ok(event_id)) => {
                debug!(attempt_id = self.attempt_id, event_id, kind = %report.kind, "Proctor event recorded");
                Some(event_id)
            }
            Retried::Done(Err(e)) => {
                warn!(attempt_id = self.attempt_id, kind = %report.kind, error = %e, "Dropping proctor event");
                None
            }
            Retried::Cancelled => {
                debug!(attempt_id = self.attempt_id, kind = %report.kind, "Proctor event abandoned on shutdown");
                None
            }
        }
    }
}
