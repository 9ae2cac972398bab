//! End-to-end tests of the attempt lifecycle over real HTTP.
//!
//! A student drives the attempt controller against a served store while a
//! proctor intervenes through the teacher routes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_session_config, spawn_server, FUTURE_EXAM, OPEN_EXAM, TEACHER, WAIT};
use exam_session::{
    AnswerSheet, AttemptController, AttemptEvent, AttemptStatus, ErrorCode, EventKind, MonitorQuery,
    ProctorConsole, SessionStore, SubmitKind, SubmitRequest,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Waits for the first event the predicate accepts.
async fn wait_for_event(
    feed: &mut broadcast::Receiver<AttemptEvent>,
    mut accept: impl FnMut(&AttemptEvent) -> bool,
) -> AttemptEvent {
    timeout(WAIT, async {
        loop {
            let event = feed.recv().await.expect("Feed closed");
            if accept(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for attempt event")
}

// ============================================================================
// Student Flow
// ============================================================================

/// Tests a full take: start, answer, submit, and a repeated submit.
#[tokio::test]
async fn test_student_takes_and_submits() {
    let server = spawn_server(common::config()).await;
    let controller = AttemptController::new(Arc::new(server.client("zhangsan")), fast_session_config());

    let handle = controller.start(OPEN_EXAM).await.expect("Start failed");
    assert_eq!(handle.status(), AttemptStatus::InProgress);
    assert_eq!(handle.questions().len(), 2);

    handle.record_answer(1, "B").await.expect("Answer rejected");
    handle.record_answer(2, "false").await.expect("Answer rejected");
    handle.record_answer(2, "true").await.expect("Answer rejected");

    let status = handle.submit(AnswerSheet::default()).await.expect("Submit failed");
    assert_eq!(status, AttemptStatus::Submitted);

    // A second submit reports the recorded status without a new transition
    let again = handle.submit(AnswerSheet::default()).await.expect("Repeat submit failed");
    assert_eq!(again, AttemptStatus::Submitted);

    let snapshot = server
        .client(TEACHER)
        .monitor_snapshot(OPEN_EXAM, &MonitorQuery::default())
        .await
        .expect("Monitor failed");
    assert_eq!(snapshot.counts.started, 1);
    assert_eq!(snapshot.counts.submitted, 1);
    assert_eq!(snapshot.counts.graded, 1);
    assert!(snapshot.submitted_users.contains(&"zhangsan".to_string()));

    handle.shutdown();
}

/// Tests that starting outside the exam window is rejected.
#[tokio::test]
async fn test_start_outside_window_is_rejected() {
    let server = spawn_server(common::config()).await;
    let controller = AttemptController::new(Arc::new(server.client("zhangsan")), fast_session_config());

    let error = controller.start(FUTURE_EXAM).await.expect_err("Start should fail");
    assert_eq!(error.code(), ErrorCode::WindowViolation);
}

/// Tests that the attempt limit applies once the only attempt is used.
#[tokio::test]
async fn test_attempt_limit_after_submit() {
    let server = spawn_server(common::config()).await;
    let client = server.client("zhangsan");

    let start = client.start_attempt(OPEN_EXAM).await.expect("Start failed");
    let request = SubmitRequest {
        attempt_id: start.attempt.id,
        answers: AnswerSheet::default(),
        kind: SubmitKind::User,
    };
    client.submit_attempt(OPEN_EXAM, &request).await.expect("Submit failed");

    let error = client.start_attempt(OPEN_EXAM).await.expect_err("Second start should fail");
    assert_eq!(error.code(), ErrorCode::AttemptLimit);
}

/// Tests that resuming returns the same in-progress attempt.
#[tokio::test]
async fn test_start_resumes_in_progress_attempt() {
    let server = spawn_server(common::config()).await;
    let client = server.client("zhangsan");

    let first = client.start_attempt(OPEN_EXAM).await.expect("Start failed");
    let second = client.start_attempt(OPEN_EXAM).await.expect("Resume failed");

    assert_eq!(first.attempt.id, second.attempt.id);
    assert_eq!(first.attempt.end_at, second.attempt.end_at);
}

/// Tests that a student cannot act on another student's attempt.
#[tokio::test]
async fn test_foreign_attempt_is_forbidden() {
    let server = spawn_server(common::config()).await;
    let start = server
        .client("zhangsan")
        .start_attempt(OPEN_EXAM)
        .await
        .expect("Start failed");

    let request = SubmitRequest {
        attempt_id: start.attempt.id,
        answers: AnswerSheet::default(),
        kind: SubmitKind::User,
    };
    let error = server
        .client("lisi")
        .submit_attempt(OPEN_EXAM, &request)
        .await
        .expect_err("Foreign submit should fail");
    assert_eq!(error.code(), ErrorCode::Forbidden);
}

// ============================================================================
// Proctor Interventions
// ============================================================================

/// Tests that a force-submit reaches a running client through polling.
#[tokio::test]
async fn test_force_submit_reaches_running_client() {
    let server = spawn_server(common::config()).await;
    let controller = AttemptController::new(Arc::new(server.client("zhangsan")), fast_session_config());
    let handle = controller.start(OPEN_EXAM).await.expect("Start failed");
    let mut feed = handle.subscribe();

    let attempt = server
        .client(TEACHER)
        .force_submit(handle.attempt_id())
        .await
        .expect("Force submit failed");
    assert_eq!(attempt.status, AttemptStatus::AutoSubmitted);

    let event = wait_for_event(&mut feed, |e| matches!(e, AttemptEvent::Submitted(_))).await;
    let AttemptEvent::Submitted(done) = event else {
        unreachable!()
    };
    assert_eq!(done.status, AttemptStatus::AutoSubmitted);
    assert_eq!(handle.status(), AttemptStatus::AutoSubmitted);

    handle.shutdown();
}

/// Tests that a reopened attempt can be picked up and submitted again.
#[tokio::test]
async fn test_reopen_after_submit() {
    let server = spawn_server(common::config()).await;
    let controller = AttemptController::new(Arc::new(server.client("zhangsan")), fast_session_config());
    let handle = controller.start(OPEN_EXAM).await.expect("Start failed");
    let mut feed = handle.subscribe();

    handle.submit(AnswerSheet::default()).await.expect("Submit failed");

    let reopened = server
        .client(TEACHER)
        .reopen(handle.attempt_id())
        .await
        .expect("Reopen failed");
    assert_eq!(reopened.status, AttemptStatus::InProgress);

    let status = handle.refresh().await.expect("Refresh failed");
    assert_eq!(status, AttemptStatus::InProgress);
    wait_for_event(&mut feed, |e| matches!(e, AttemptEvent::Reopened(_))).await;

    handle.record_answer(1, "B").await.expect("Answer rejected");
    let status = handle.submit(AnswerSheet::default()).await.expect("Second submit failed");
    assert_eq!(status, AttemptStatus::Submitted);

    handle.shutdown();
}

/// Tests that an in-progress attempt cannot be reopened.
#[tokio::test]
async fn test_reopen_in_progress_is_rejected() {
    let server = spawn_server(common::config()).await;
    let start = server
        .client("zhangsan")
        .start_attempt(OPEN_EXAM)
        .await
        .expect("Start failed");

    let error = server
        .client(TEACHER)
        .reopen(start.attempt.id)
        .await
        .expect_err("Reopen should fail");
    assert_eq!(error.code(), ErrorCode::InvalidTransition);
}

/// Tests that reminders surface on the client feed.
#[tokio::test]
async fn test_reminder_is_delivered() {
    let server = spawn_server(common::config()).await;
    let controller = AttemptController::new(Arc::new(server.client("zhangsan")), fast_session_config());
    let handle = controller.start(OPEN_EXAM).await.expect("Start failed");
    let mut feed = handle.subscribe();

    server
        .client(TEACHER)
        .remind(handle.attempt_id(), "Twenty minutes left")
        .await
        .expect("Remind failed");

    let event = wait_for_event(&mut feed, |e| matches!(e, AttemptEvent::Reminder(_))).await;
    let AttemptEvent::Reminder(reminder) = event else {
        unreachable!()
    };
    assert_eq!(reminder.message, "Twenty minutes left");
    assert_eq!(handle.status(), AttemptStatus::InProgress);

    handle.shutdown();
}

/// Tests that a student is refused on the teacher routes.
#[tokio::test]
async fn test_student_cannot_force_submit() {
    let server = spawn_server(common::config()).await;
    let student = server.client("zhangsan");
    let start = student.start_attempt(OPEN_EXAM).await.expect("Start failed");

    let error = student
        .force_submit(start.attempt.id)
        .await
        .expect_err("Student force submit should fail");
    assert_eq!(error.code(), ErrorCode::Forbidden);
}

// ============================================================================
// Monitoring
// ============================================================================

/// Tests that heartbeats and proctor events show up in the monitor view.
#[tokio::test]
async fn test_heartbeat_and_events_reach_monitor() {
    let server = spawn_server(common::config()).await;
    let controller = AttemptController::new(Arc::new(server.client("zhangsan")), fast_session_config());
    let handle = controller.start(OPEN_EXAM).await.expect("Start failed");
    handle
        .report(EventKind::WindowBlur, None)
        .await
        .expect("Report failed");

    let teacher = server.client(TEACHER);
    let snapshot = timeout(WAIT, async {
        loop {
            let snapshot = teacher
                .monitor_snapshot(OPEN_EXAM, &MonitorQuery::default())
                .await
                .expect("Monitor failed");
            let row = snapshot
                .rows
                .iter()
                .find(|r| r.username == "zhangsan")
                .expect("Missing row");
            if row.last_heartbeat.is_some() && !snapshot.recent_events.is_empty() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Timeout waiting for monitor data");

    assert_eq!(snapshot.counts.in_progress, 1);
    assert!(snapshot.in_progress_users.contains(&"zhangsan".to_string()));
    assert_eq!(snapshot.recent_events[0].kind, EventKind::WindowBlur);
    assert_eq!(snapshot.recent_events[0].username, "zhangsan");

    // lisi is on the roster but never started
    let lisi = snapshot.rows.iter().find(|r| r.username == "lisi").expect("Missing lisi");
    assert_eq!(lisi.attempt_id, None);

    handle.shutdown();
}
