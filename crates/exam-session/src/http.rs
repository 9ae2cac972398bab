//! HTTP implementation of the collaborator traits.
//!
//! [`HttpSessionStore`] talks to the session store's JSON API with a bearer
//! credential. It implements [`SessionStore`] for the student side and
//! [`ProctorConsole`] and [`Analysis`] for the rest, so one client serves
//! every command of the CLI.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attempt::{Attempt, AttemptId, ExamId};
use crate::error::{ErrorBody, Result, SessionError};
use crate::explain::{ExplanationStream, StreamError};
use crate::monitor::{MonitorQuery, MonitorSnapshot};
use crate::proctor::{EventId, Heartbeat, MessageId, ProctorMessage};
use crate::store::{
    Analysis, AttemptStart, Credential, EventReceipt, EventReport, Explanation, ExplainRequest, MessagesQuery,
    ProctorConsole, RemindRequest, SessionStore, SubmitReceipt, SubmitRequest,
};

/// Timeout for plain JSON calls. Streamed explanations have none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session store client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSessionStore {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl HttpSessionStore {
    /// Creates a client for the store at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Network` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SessionError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        })
    }

    /// The store's base URL, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn student(&self, exam_id: ExamId, action: &str) -> String {
        self.url(&format!("/api/student/exams/{exam_id}/{action}"))
    }

    fn teacher(&self, attempt_id: AttemptId, action: &str) -> String {
        self.url(&format!("/api/teacher/attempts/{attempt_id}/{action}"))
    }

    /// Sends a request and returns the response if it succeeded.
    async fn execute(&self, request: RequestBuilder, attempt_id: Option<AttemptId>) -> Result<Response> {
        let response = request
            .bearer_auth(self.credential.token())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(rejection(response, attempt_id).await)
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, attempt_id: Option<AttemptId>) -> Result<T> {
        let response = self.execute(request, attempt_id).await?;
        response.json().await.map_err(|e| transport_error(&e))
    }
}

/// Maps a reqwest failure. Unparseable bodies are not worth retrying.
fn transport_error(e: &reqwest::Error) -> SessionError {
    if e.is_decode() {
        SessionError::Store {
            status: e.status().map_or(200, |s| s.as_u16()),
            message: format!("malformed response: {e}"),
        }
    } else {
        SessionError::network(e.to_string())
    }
}

/// Rebuilds the typed error from a failed response.
async fn rejection(response: Response, attempt_id: Option<AttemptId>) -> SessionError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    debug!(status, body = %text, "Store rejected request");

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => SessionError::from_body(status, attempt_id, body),
        Err(_) if status == 401 => SessionError::unauthorized(text),
        Err(_) => SessionError::Store { status, message: text },
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    async fn start_attempt(&self, exam_id: ExamId) -> Result<AttemptStart> {
        let request = self.client.post(self.student(exam_id, "start"));
        self.fetch(request, None).await
    }

    async fn submit_attempt(&self, exam_id: ExamId, request: &SubmitRequest) -> Result<SubmitReceipt> {
        let builder = self.client.post(self.student(exam_id, "submit")).json(request);
        self.fetch(builder, Some(request.attempt_id)).await
    }

    async fn record_heartbeat(&self, exam_id: ExamId, heartbeat: &Heartbeat) -> Result<()> {
        let request = self.client.post(self.student(exam_id, "heartbeat")).json(heartbeat);
        self.execute(request, Some(heartbeat.attempt_id)).await?;
        Ok(())
    }

    async fn record_event(&self, exam_id: ExamId, report: &EventReport) -> Result<EventId> {
        let request = self.client.post(self.student(exam_id, "events")).json(report);
        let receipt: EventReceipt = self.fetch(request, Some(report.attempt_id)).await?;
        Ok(receipt.event_id)
    }

    async fn list_messages_since(
        &self,
        exam_id: ExamId,
        attempt_id: AttemptId,
        after: Option<MessageId>,
    ) -> Result<Vec<ProctorMessage>> {
        let query = MessagesQuery {
            attempt_id,
            after_id: after,
        };
        let request = self
            .client
            .get(self.student(exam_id, "proctor/messages"))
            .query(&query);
        self.fetch(request, Some(attempt_id)).await
    }
}

#[async_trait]
impl ProctorConsole for HttpSessionStore {
    async fn force_submit(&self, attempt_id: AttemptId) -> Result<Attempt> {
        let request = self.client.post(self.teacher(attempt_id, "force-submit"));
        self.fetch(request, Some(attempt_id)).await
    }

    async fn reopen(&self, attempt_id: AttemptId) -> Result<Attempt> {
        let request = self.client.post(self.teacher(attempt_id, "reopen"));
        self.fetch(request, Some(attempt_id)).await
    }

    async fn remind(&self, attempt_id: AttemptId, message: &str) -> Result<ProctorMessage> {
        let body = RemindRequest {
            message: message.to_string(),
        };
        let request = self.client.post(self.teacher(attempt_id, "remind")).json(&body);
        self.fetch(request, Some(attempt_id)).await
    }

    async fn monitor_snapshot(&self, exam_id: ExamId, query: &MonitorQuery) -> Result<MonitorSnapshot> {
        let request = self
            .client
            .get(self.url(&format!("/api/teacher/exams/{exam_id}/monitor")))
            .query(query);
        self.fetch(request, None).await
    }
}

#[async_trait]
impl Analysis for HttpSessionStore {
    async fn explain(&self, exam_id: ExamId, request: &ExplainRequest) -> Result<String> {
        let builder = self.client.post(self.student(exam_id, "result/ai")).json(request);
        let explanation: Explanation = self.fetch(builder, None).await?;
        Ok(explanation.content)
    }

    async fn explain_stream(&self, exam_id: ExamId, request: &ExplainRequest) -> ExplanationStream {
        let sent = self
            .client
            .post(self.student(exam_id, "result/ai/stream"))
            .bearer_auth(self.credential.token())
            .json(request)
            .send()
            .await;

        match sent {
            Ok(response) => ExplanationStream::from_response(response, CancellationToken::new()),
            Err(e) => ExplanationStream::failed(StreamError::transport(e.to_string())),
        }
    }
}
