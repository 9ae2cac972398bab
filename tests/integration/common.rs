//! Shared fixtures for the end-to-end tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use exam_server::{AppState, ExamDefinition, Generator, MemoryStore, ServerConfig, SystemClock};
use exam_session::{
    Credential, Exam, ExamSettings, HttpSessionStore, Question, QuestionKind, SessionConfig, StudentIdentity,
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Exam whose window contains now.
pub const OPEN_EXAM: u64 = 1;

/// Exam whose window starts an hour from now.
pub const FUTURE_EXAM: u64 = 2;

/// Proctor allowed on the teacher routes.
pub const TEACHER: &str = "wanglaoshi";

/// Reply of [`CannedGenerator`], sent in these fragments when streamed.
pub const CANNED_FRAGMENTS: [&str; 3] = ["选B，", "因为栈是", "后进先出的结构。"];

/// Explanation backend that never leaves the process.
#[derive(Debug)]
pub struct CannedGenerator;

#[async_trait]
impl Generator for CannedGenerator {
    async fn generate(&self, _prompt: &str) -> exam_session::Result<String> {
        Ok(CANNED_FRAGMENTS.concat())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
    ) -> exam_session::Result<BoxStream<'static, exam_session::Result<String>>> {
        Ok(stream::iter(CANNED_FRAGMENTS.map(|f| Ok(f.to_string()))).boxed())
    }
}

fn exam(id: u64, name: &str, starts_in_minutes: i64) -> ExamDefinition {
    let start_at = Utc::now() + chrono::Duration::minutes(starts_in_minutes);
    ExamDefinition {
        exam: Exam {
            id,
            name: name.to_string(),
            paper_id: 100 + id,
            start_at,
            end_at: start_at + chrono::Duration::hours(2),
            settings: ExamSettings::default(),
        },
        questions: vec![
            Question {
                id: 1,
                kind: QuestionKind::SingleChoice,
                stem: "Which structure is last in, first out?".to_string(),
                options: vec!["Queue".to_string(), "Stack".to_string(), "Heap".to_string()],
                score: 5,
                answer: Some("B".to_string()),
            },
            Question {
                id: 2,
                kind: QuestionKind::TrueFalse,
                stem: "A binary heap is a complete binary tree.".to_string(),
                options: Vec::new(),
                score: 5,
                answer: Some("true".to_string()),
            },
        ],
    }
}

/// Server configuration with one open and one future exam.
pub fn config() -> ServerConfig {
    ServerConfig {
        teachers: vec![TEACHER.to_string()],
        roster: vec![
            StudentIdentity {
                username: "zhangsan".to_string(),
                full_name: Some("Zhang San".to_string()),
                student_no: Some("2024001".to_string()),
            },
            StudentIdentity {
                username: "lisi".to_string(),
                full_name: Some("Li Si".to_string()),
                student_no: Some("2024002".to_string()),
            },
        ],
        exams: vec![exam(OPEN_EXAM, "Data Structures Midterm", -10), exam(FUTURE_EXAM, "Algorithms Final", 60)],
        ..ServerConfig::default()
    }
}

/// A store served on a local port.
pub struct TestServer {
    pub base_url: String,
    pub ws_url: String,
    pub store: Arc<MemoryStore>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// HTTP client acting as `user`.
    pub fn client(&self, user: &str) -> HttpSessionStore {
        HttpSessionStore::new(&self.base_url, Credential::bearer(user)).expect("Failed to build client")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spawns the store on an ephemeral port.
pub async fn spawn_server(config: ServerConfig) -> TestServer {
    let store = Arc::new(MemoryStore::new(config, Arc::new(SystemClock)));
    let state = AppState::new(Arc::clone(&store), Arc::new(CannedGenerator));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        exam_server::serve(listener, state, server_shutdown)
            .await
            .expect("Server failed");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws/teacher/exams"),
        store,
        shutdown,
    }
}

/// Client tunables with one-second polling so proctor actions land quickly.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval_secs: 1,
        poll_interval_secs: 1,
        ..SessionConfig::default()
    }
}

/// How long a test waits for something asynchronous to happen.
pub const WAIT: Duration = Duration::from_secs(5);
