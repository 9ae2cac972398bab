//! Exam Session CLI
//!
//! Runs the reference session store and drives it from the command line as
//! a student (take an exam, ask for explanations) or as a proctor (monitor,
//! force-submit, reopen, remind).

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use exam_server::{AppState, MemoryStore, OllamaGenerator, ServerConfig, SystemClock};
use exam_session::{
    Analysis, AnswerSheet, AttemptController, AttemptEvent, AttemptHandle, AttemptId, ChatMessage, Credential,
    ExamId, ExplainRequest, HttpSessionStore, MonitorQuery, MonitorSnapshot, ProctorConsole, QuestionId,
    QuestionKind, QuestionSnapshot, SessionConfig, StatusFilter,
};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default base URL of the session store.
const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

/// Exam Session - Proctored Online Exam Tool
///
/// Serves the reference session store, takes exams against it, and gives
/// proctors their monitoring and intervention commands.
#[derive(Parser, Debug)]
#[command(name = "examctl")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Base URL of the session store
    #[arg(short, long, global = true, default_value = DEFAULT_SERVER)]
    server: String,

    /// Username sent as the bearer credential
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the in-memory session store
    Serve {
        /// Path to configuration file (default: exam-server.json in current directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Take an exam as a student
    Take {
        /// Exam to take
        exam_id: ExamId,

        /// Answer to buffer, as QUESTION_ID=ANSWER (repeatable)
        #[arg(short, long = "answer", value_name = "QID=ANSWER", value_parser = parse_answer)]
        answers: Vec<(QuestionId, String)>,

        /// Submit right after buffering the answers
        #[arg(long)]
        submit: bool,

        /// Path to client configuration (default: exam-session.json in current directory)
        #[arg(long, value_name = "FILE")]
        session_config: Option<PathBuf>,
    },

    /// Show the monitor view of an exam
    Monitor {
        /// Exam to monitor
        exam_id: ExamId,

        /// Only show students in this state
        #[arg(short, long, value_enum, default_value_t = FilterArg::All)]
        filter: FilterArg,

        /// Substring of username, full name or student number
        #[arg(short, long)]
        keyword: Option<String>,

        /// Usernames to flag
        #[arg(long, value_delimiter = ',')]
        highlight: Vec<String>,

        /// Refresh every SECS seconds until Ctrl+C
        #[arg(short, long, value_name = "SECS")]
        watch: Option<u64>,
    },

    /// Force an attempt into AUTO_SUBMITTED
    ForceSubmit {
        /// Attempt to submit
        attempt_id: AttemptId,
    },

    /// Reopen a submitted attempt
    Reopen {
        /// Attempt to reopen
        attempt_id: AttemptId,
    },

    /// Send a reminder to a student
    Remind {
        /// Attempt to notify
        attempt_id: AttemptId,

        /// Reminder text
        message: String,
    },

    /// Explain a graded question
    Explain {
        /// Exam the question belongs to
        exam_id: ExamId,

        /// Question to explain
        question_id: QuestionId,

        /// Follow-up question for the explanation
        #[arg(long)]
        ask: Option<String>,

        /// Wait for the whole explanation instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FilterArg {
    All,
    InProgress,
    Submitted,
}

impl From<FilterArg> for StatusFilter {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::All => Self::All,
            FilterArg::InProgress => Self::InProgress,
            FilterArg::Submitted => Self::Submitted,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(server = %args.server, user = ?args.user, "examctl starting");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let Args {
        command, server, user, ..
    } = args;

    match command {
        Command::Serve { config, host, port } => run_serve(config.as_deref(), host, port).await,
        Command::Take {
            exam_id,
            answers,
            submit,
            session_config,
        } => {
            let store = connect(&server, user.as_deref())?;
            let config = load_session_config(session_config.as_deref())?;
            run_take(store, config, exam_id, answers, submit).await
        }
        Command::Monitor {
            exam_id,
            filter,
            keyword,
            highlight,
            watch,
        } => {
            let store = connect(&server, user.as_deref())?;
            let query = MonitorQuery {
                filter: filter.into(),
                keyword,
                highlighted: highlight.into_iter().collect(),
            };
            run_monitor(&store, exam_id, &query, watch).await
        }
        Command::ForceSubmit { attempt_id } => {
            let store = connect(&server, user.as_deref())?;
            let attempt = store.force_submit(attempt_id).await?;
            println!("Attempt {} is {}", attempt.id, attempt.status);
            Ok(())
        }
        Command::Reopen { attempt_id } => {
            let store = connect(&server, user.as_deref())?;
            let attempt = store.reopen(attempt_id).await?;
            println!("Attempt {} is {} until {}", attempt.id, attempt.status, attempt.end_at);
            Ok(())
        }
        Command::Remind { attempt_id, message } => {
            let store = connect(&server, user.as_deref())?;
            let sent = store.remind(attempt_id, &message).await?;
            println!("Reminder {} sent to attempt {attempt_id}", sent.id);
            Ok(())
        }
        Command::Explain {
            exam_id,
            question_id,
            ask,
            no_stream,
        } => {
            let store = connect(&server, user.as_deref())?;
            let request = ExplainRequest {
                question_id,
                messages: ask
                    .into_iter()
                    .map(|content| ChatMessage {
                        role: "user".to_string(),
                        content,
                    })
                    .collect(),
            };
            run_explain(&store, exam_id, &request, no_stream).await
        }
    }
}

// ============================================================================
// Setup
// ============================================================================

/// Parses a `QUESTION_ID=ANSWER` pair.
fn parse_answer(raw: &str) -> Result<(QuestionId, String), String> {
    let (id, answer) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected QUESTION_ID=ANSWER, got '{raw}'"))?;
    let id = id
        .trim()
        .parse::<QuestionId>()
        .map_err(|e| format!("invalid question id '{id}': {e}"))?;
    Ok((id, answer.to_string()))
}

fn connect(server: &str, user: Option<&str>) -> anyhow::Result<HttpSessionStore> {
    let user = user
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("No user given\n\nSuggestion: Pass your username with --user"))?;
    HttpSessionStore::new(server, Credential::bearer(user)).map_err(|e| anyhow::anyhow!("{e}"))
}

fn load_session_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --session-config flag to use defaults",
                    path.display()
                );
            }
            SessionConfig::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => SessionConfig::load_from_dir(Path::new(".")).map_err(|e| anyhow::anyhow!("{e}")),
    }
}

fn load_server_config(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            ServerConfig::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => ServerConfig::load_from_dir(Path::new(".")).map_err(|e| anyhow::anyhow!("{e}")),
    }
}

// ============================================================================
// Serve
// ============================================================================

async fn run_serve(config: Option<&Path>, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_server_config(config)?;

    // Apply CLI argument overrides
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    if config.exams.is_empty() {
        println!("Warning: no exams configured; every exam route will answer 404");
    }

    let generator = OllamaGenerator::new(&config.analysis).map_err(|e| anyhow::anyhow!("{e}"))?;
    let addr = format!("{}:{}", config.host, config.port);
    let exams = config.exams.len();
    let store = Arc::new(MemoryStore::new(config, Arc::new(SystemClock)));
    let state = AppState::new(store, Arc::new(generator));

    println!("Starting session store on {addr}...");
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port")
    })?;
    let local = listener.local_addr()?;
    println!("Session store running on http://{local} with {exams} exam(s)");
    println!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        trigger.cancel();
    });

    exam_server::serve(listener, state, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;

    println!("Session store stopped");
    Ok(())
}

// ============================================================================
// Take
// ============================================================================

fn kind_label(kind: QuestionKind) -> &'static str {
    match kind {
        QuestionKind::SingleChoice => "single choice",
        QuestionKind::MultipleChoice => "multiple choice",
        QuestionKind::TrueFalse => "true/false",
        QuestionKind::FillBlank => "fill in the blank",
        QuestionKind::ShortAnswer => "short answer",
    }
}

fn print_question(number: usize, question: &QuestionSnapshot) {
    println!(
        "{number}. [{}, {} pts, id {}] {}",
        kind_label(question.kind),
        question.score,
        question.id,
        question.stem
    );
    for (letter, option) in ('A'..='Z').zip(&question.options) {
        println!("   {letter}. {option}");
    }
}

async fn run_take(
    store: HttpSessionStore,
    config: SessionConfig,
    exam_id: ExamId,
    answers: Vec<(QuestionId, String)>,
    submit_now: bool,
) -> anyhow::Result<()> {
    let controller = AttemptController::new(Arc::new(store), config);
    let handle = controller.start(exam_id).await?;

    println!("Attempt {} started, due {}", handle.attempt_id(), handle.end_at());
    println!();
    for (index, question) in handle.questions().iter().enumerate() {
        print_question(index + 1, question);
    }
    println!();

    for (question_id, answer) in answers {
        handle.record_answer(question_id, answer).await?;
    }

    let result = if submit_now {
        let status = handle.submit(AnswerSheet::default()).await?;
        println!("Attempt {} is {status}", handle.attempt_id());
        Ok(())
    } else {
        follow_attempt(&handle).await
    };

    handle.shutdown();
    result
}

/// Prints attempt notifications until the attempt is terminal.
///
/// Ctrl+C submits the buffered answers.
async fn follow_attempt(handle: &AttemptHandle) -> anyhow::Result<()> {
    let mut feed = handle.subscribe();
    if handle.status().is_terminal() {
        println!("Attempt {} is {}", handle.attempt_id(), handle.status());
        return Ok(());
    }

    println!("Waiting for the deadline or a proctor action. Press Ctrl+C to submit now");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                match handle.submit(AnswerSheet::default()).await {
                    Ok(status) => {
                        println!("Attempt {} is {status}", handle.attempt_id());
                        return Ok(());
                    }
                    Err(e) => println!("Submit failed: {e}. Answers are kept; press Ctrl+C to retry"),
                }
            }
            event = feed.recv() => match event {
                Ok(AttemptEvent::Reminder(reminder)) => println!("Proctor: {}", reminder.message),
                Ok(AttemptEvent::DeadlineReached(deadline)) => {
                    if deadline.auto_submit {
                        println!("Time is up, submitting");
                    } else {
                        println!("Time is up");
                    }
                }
                Ok(AttemptEvent::SubmitFailed(failure)) => {
                    println!("Submit failed: {}. Answers are kept; press Ctrl+C to retry", failure.message);
                }
                Ok(AttemptEvent::Reopened(active)) => println!("Attempt reopened until {}", active.end_at),
                Ok(AttemptEvent::Submitted(done)) => {
                    println!("Attempt {} is {}", done.attempt_id, done.status);
                    return Ok(());
                }
                Ok(AttemptEvent::Started(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Missed attempt notifications");
                }
                Err(RecvError::Closed) => {
                    anyhow::bail!("Attempt controller stopped unexpectedly");
                }
            }
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

fn print_snapshot(snapshot: &MonitorSnapshot) {
    let counts = &snapshot.counts;
    println!(
        "Exam {} at {}: {} started, {} in progress, {} submitted, {} graded",
        snapshot.exam_id,
        snapshot.generated_at.format("%H:%M:%S"),
        counts.started,
        counts.in_progress,
        counts.submitted,
        counts.graded
    );
    println!(
        "  {:<16} {:<20} {:<16} {:>8} {:>6} {:>9}  {}",
        "USER", "NAME", "STATUS", "ATTEMPT", "LEAVES", "AWAY(s)", "LAST HEARTBEAT"
    );
    for row in &snapshot.rows {
        let marker = if row.highlighted { '*' } else { ' ' };
        let attempt = row.attempt_id.map_or_else(|| "-".to_string(), |id| id.to_string());
        let heartbeat = row
            .last_heartbeat
            .map_or_else(|| "-".to_string(), |ts| ts.format("%H:%M:%S").to_string());
        println!(
            "{marker} {:<16} {:<20} {:<16} {:>8} {:>6} {:>9}  {heartbeat}",
            row.username,
            row.display_name,
            row.status.to_string(),
            attempt,
            row.tab_switches,
            row.away_seconds
        );
    }
    if let Some(event) = snapshot.recent_events.first() {
        println!("Latest event: {} {} at {}", event.username, event.kind, event.created_at);
    }
}

async fn run_monitor(
    store: &HttpSessionStore,
    exam_id: ExamId,
    query: &MonitorQuery,
    watch: Option<u64>,
) -> anyhow::Result<()> {
    let Some(secs) = watch else {
        print_snapshot(&store.monitor_snapshot(exam_id, query).await?);
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                match store.monitor_snapshot(exam_id, query).await {
                    Ok(snapshot) => {
                        println!();
                        print_snapshot(&snapshot);
                    }
                    Err(e) if e.is_transient() => println!("Refresh failed: {e}"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

// ============================================================================
// Explain
// ============================================================================

async fn run_explain(
    store: &HttpSessionStore,
    exam_id: ExamId,
    request: &ExplainRequest,
    no_stream: bool,
) -> anyhow::Result<()> {
    if no_stream {
        println!("{}", store.explain(exam_id, request).await?);
        return Ok(());
    }

    let mut stream = store.explain_stream(exam_id, request).await;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                println!();
                println!("Cancelled");
                return Ok(());
            }
            fragment = stream.next() => match fragment {
                Some(Ok(text)) => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
                Some(Err(e)) => {
                    println!();
                    anyhow::bail!("Explanation failed: {e}");
                }
                None => break,
            }
        }
    }
    println!();
    Ok(())
}
