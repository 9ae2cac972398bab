//! End-to-end tests of graded-question explanations.
//!
//! The served store uses a canned backend. The byte-level tests run a bare
//! axum route so chunk boundaries are under the test's control.

mod common;

use std::convert::Infallible;
use std::time::Duration;

use axum::{body::Body, routing::post, Router};
use common::{spawn_server, CANNED_FRAGMENTS, OPEN_EXAM, WAIT};
use exam_session::{
    Analysis, AnswerSheet, Credential, ErrorCode, ExplainRequest, HttpSessionStore, SessionStore, StreamError,
    StreamOutcome, SubmitKind, SubmitRequest,
};
use futures::stream::{self, StreamExt};
use tokio::time::timeout;

fn request(question_id: u64) -> ExplainRequest {
    ExplainRequest {
        question_id,
        messages: Vec::new(),
    }
}

/// Starts and submits an attempt so its result exists.
async fn submit_attempt(client: &HttpSessionStore) {
    let start = client.start_attempt(OPEN_EXAM).await.expect("Start failed");
    let answers: AnswerSheet = [(1, "A")].into_iter().collect();
    let submit = SubmitRequest {
        attempt_id: start.attempt.id,
        answers,
        kind: SubmitKind::User,
    };
    client.submit_attempt(OPEN_EXAM, &submit).await.expect("Submit failed");
}

/// Serves a stream route that writes `chunks` with a short pause between
/// them, then stays open if `hang` is set.
async fn spawn_chunk_server(chunks: Vec<Vec<u8>>, hang: bool) -> String {
    let handler = move || {
        let chunks = chunks.clone();
        async move {
            let tail = if hang {
                stream::pending().boxed()
            } else {
                stream::empty().boxed()
            };
            let body = stream::iter(chunks)
                .then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, Infallible>(chunk)
                })
                .chain(tail);
            Body::from_stream(body)
        }
    };
    let router = Router::new().route("/api/student/exams/:id/result/ai/stream", post(handler));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    format!("http://{addr}")
}

// ============================================================================
// Served Store
// ============================================================================

/// Tests the non-streamed explanation of a graded question.
#[tokio::test]
async fn test_explain_after_submit() {
    let server = spawn_server(common::config()).await;
    let client = server.client("zhangsan");
    submit_attempt(&client).await;

    let text = client.explain(OPEN_EXAM, &request(1)).await.expect("Explain failed");
    assert_eq!(text, CANNED_FRAGMENTS.concat());
}

/// Tests that streamed fragments arrive in order and complete.
#[tokio::test]
async fn test_explain_stream_after_submit() {
    let server = spawn_server(common::config()).await;
    let client = server.client("zhangsan");
    submit_attempt(&client).await;

    let mut stream = client.explain_stream(OPEN_EXAM, &request(1)).await;
    let mut text = String::new();
    while let Some(fragment) = timeout(WAIT, stream.next()).await.expect("Timeout") {
        text.push_str(&fragment.expect("Fragment failed"));
    }

    assert_eq!(text, CANNED_FRAGMENTS.concat());
    assert!(matches!(stream.outcome(), StreamOutcome::Completed));
}

/// Tests that explanations need a graded attempt.
#[tokio::test]
async fn test_explain_before_submit_is_not_found() {
    let server = spawn_server(common::config()).await;
    let client = server.client("zhangsan");
    client.start_attempt(OPEN_EXAM).await.expect("Start failed");

    let error = client
        .explain(OPEN_EXAM, &request(1))
        .await
        .expect_err("Explain should fail");
    assert_eq!(error.code(), ErrorCode::NotFound);

    let result = client.explain_stream(OPEN_EXAM, &request(1)).await.read_to_end().await;
    assert!(matches!(result, Err(StreamError::Rejected { status: 404, .. })));
}

/// Tests that question id zero is a bad request.
#[tokio::test]
async fn test_explain_question_zero_is_bad_request() {
    let server = spawn_server(common::config()).await;
    let client = server.client("zhangsan");
    submit_attempt(&client).await;

    let error = client
        .explain(OPEN_EXAM, &request(0))
        .await
        .expect_err("Explain should fail");
    assert_eq!(error.code(), ErrorCode::BadRequest);
}

// ============================================================================
// Byte-Level Streaming
// ============================================================================

/// Tests that characters split across chunks are decoded whole.
#[tokio::test]
async fn test_stream_reassembles_split_characters() {
    let bytes = "你好，世界".as_bytes().to_vec();
    // Cut inside the first and the fourth character
    let chunks = vec![bytes[..2].to_vec(), bytes[2..10].to_vec(), bytes[10..].to_vec()];
    let base = spawn_chunk_server(chunks, false).await;
    let client = HttpSessionStore::new(base, Credential::bearer("zhangsan")).expect("Client");

    let text = timeout(WAIT, client.explain_stream(OPEN_EXAM, &request(1)).await.read_to_end())
        .await
        .expect("Timeout")
        .expect("Stream failed");
    assert_eq!(text, "你好，世界");
}

/// Tests that cancelling ends a stream the server keeps open.
#[tokio::test]
async fn test_cancel_ends_open_stream() {
    let base = spawn_chunk_server(vec!["第一段".as_bytes().to_vec()], true).await;
    let client = HttpSessionStore::new(base, Credential::bearer("zhangsan")).expect("Client");

    let mut stream = client.explain_stream(OPEN_EXAM, &request(1)).await;
    let first = timeout(WAIT, stream.next())
        .await
        .expect("Timeout")
        .expect("Stream ended")
        .expect("Fragment failed");
    assert_eq!(first, "第一段");

    stream.cancel();
    let next = timeout(WAIT, stream.next()).await.expect("Cancel did not end stream");
    assert!(next.is_none());
    assert!(matches!(stream.outcome(), StreamOutcome::Cancelled));
}
