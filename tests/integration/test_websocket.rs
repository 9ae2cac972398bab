//! Integration tests for the live monitor feed.
//!
//! These tests validate the WebSocket endpoint: the credential check, the
//! connected snapshot, and the per-exam broadcast of store changes.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{spawn_server, TestServer, FUTURE_EXAM, OPEN_EXAM, TEACHER, WAIT};
use exam_server::MonitorEvent;
use exam_session::{AttemptStatus, Heartbeat, ProctorConsole, SessionStore};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Helper type for WebSocket client
type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to an exam's feed with an optional bearer credential.
async fn try_connect(server: &TestServer, exam_id: u64, user: Option<&str>) -> Result<WsClient, tungstenite::Error> {
    let mut request = format!("{}/{exam_id}", server.ws_url)
        .into_client_request()
        .expect("Invalid URL");
    if let Some(user) = user {
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {user}").parse().expect("Invalid header"),
        );
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn connect_teacher(server: &TestServer, exam_id: u64) -> WsClient {
    try_connect(server, exam_id, Some(TEACHER))
        .await
        .expect("Failed to connect to WebSocket")
}

/// Receives the next text message and parses it as a `MonitorEvent`.
/// Pings and pongs are skipped.
async fn receive_event(client: &mut WsClient) -> MonitorEvent {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

/// Asserts the rejection status of a refused upgrade.
fn assert_refused(result: Result<WsClient, tungstenite::Error>, status: u16) {
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), status),
        Err(other) => panic!("Expected HTTP {status}, got: {other}"),
        Ok(_) => panic!("Expected HTTP {status}, connection was accepted"),
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

/// Tests that the first message is the current monitor snapshot.
#[tokio::test]
async fn test_connected_event_carries_snapshot() {
    let server = spawn_server(common::config()).await;
    server
        .client("zhangsan")
        .start_attempt(OPEN_EXAM)
        .await
        .expect("Start failed");

    let mut client = connect_teacher(&server, OPEN_EXAM).await;
    let event = receive_event(&mut client).await;

    let MonitorEvent::Connected(payload) = event else {
        panic!("Expected Connected event, got: {event:?}");
    };
    assert_eq!(payload.snapshot.exam_id, OPEN_EXAM);
    assert_eq!(payload.snapshot.counts.in_progress, 1);
    assert_eq!(payload.snapshot.rows.len(), 2);
}

/// Tests the credential and exam checks made before upgrading.
#[tokio::test]
async fn test_upgrade_is_refused_without_teacher_credential() {
    let server = spawn_server(common::config()).await;

    assert_refused(try_connect(&server, OPEN_EXAM, None).await, 401);
    assert_refused(try_connect(&server, OPEN_EXAM, Some("zhangsan")).await, 403);
    assert_refused(try_connect(&server, 99, Some(TEACHER)).await, 404);
}

/// Tests that several proctors can watch the same exam.
#[tokio::test]
async fn test_multiple_clients_receive_broadcast() {
    let server = spawn_server(common::config()).await;
    let mut client1 = connect_teacher(&server, OPEN_EXAM).await;
    let mut client2 = connect_teacher(&server, OPEN_EXAM).await;
    receive_event(&mut client1).await;
    receive_event(&mut client2).await;

    server
        .client("zhangsan")
        .start_attempt(OPEN_EXAM)
        .await
        .expect("Start failed");

    for client in [&mut client1, &mut client2] {
        let event = receive_event(client).await;
        let MonitorEvent::AttemptStarted(payload) = event else {
            panic!("Expected AttemptStarted event, got: {event:?}");
        };
        assert_eq!(payload.attempt.username, "zhangsan");
        assert_eq!(payload.attempt.status, AttemptStatus::InProgress);
    }
}

// ============================================================================
// Event Broadcast Tests
// ============================================================================

/// Tests the sequence of events produced by one proctored attempt.
#[tokio::test]
async fn test_attempt_activity_is_broadcast() {
    let server = spawn_server(common::config()).await;
    let mut client = connect_teacher(&server, OPEN_EXAM).await;
    receive_event(&mut client).await;

    let student = server.client("zhangsan");
    let attempt_id = student.start_attempt(OPEN_EXAM).await.expect("Start failed").attempt.id;
    assert_eq!(receive_event(&mut client).await.event_name(), "attempt_started");

    let beat = Heartbeat {
        attempt_id,
        username: "zhangsan".to_string(),
        ts: Utc::now(),
    };
    student.record_heartbeat(OPEN_EXAM, &beat).await.expect("Heartbeat failed");
    let MonitorEvent::Heartbeat(payload) = receive_event(&mut client).await else {
        panic!("Expected Heartbeat event");
    };
    assert_eq!(payload.heartbeat.attempt_id, attempt_id);

    let teacher = server.client(TEACHER);
    teacher.remind(attempt_id, "Please stay on the page").await.expect("Remind failed");
    let MonitorEvent::MessageSent(payload) = receive_event(&mut client).await else {
        panic!("Expected MessageSent event");
    };
    assert_eq!(payload.message.message, "Please stay on the page");

    teacher.force_submit(attempt_id).await.expect("Force submit failed");
    let mut names = Vec::new();
    for _ in 0..2 {
        names.push(receive_event(&mut client).await.event_name());
    }
    names.sort_unstable();
    assert_eq!(names, vec!["attempt_submitted", "message_sent"]);
}

/// Tests that a feed only carries its own exam.
#[tokio::test]
async fn test_other_exams_are_filtered() {
    let server = spawn_server(common::config()).await;
    let mut client = connect_teacher(&server, FUTURE_EXAM).await;
    let MonitorEvent::Connected(payload) = receive_event(&mut client).await else {
        panic!("Expected Connected event");
    };
    assert_eq!(payload.snapshot.exam_id, FUTURE_EXAM);

    server
        .client("zhangsan")
        .start_attempt(OPEN_EXAM)
        .await
        .expect("Start failed");

    let quiet = timeout(Duration::from_millis(300), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => {}
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "Unexpected event: {quiet:?}");
}
