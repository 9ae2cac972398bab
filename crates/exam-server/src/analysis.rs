//! Explanation backend.
//!
//! The store builds a tutoring prompt from the graded question and forwards
//! it to an Ollama-compatible `/api/generate` endpoint. The streamed variant
//! reads the backend's newline-delimited JSON and yields the `response`
//! fragment of each line until a line reports `done`.

use std::fmt::{Debug, Display, Write as _};
use std::time::Duration;

use async_trait::async_trait;
use exam_session::{ChatMessage, QuestionKind, Result, SessionError};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::store::ExplainContext;

/// Timeout for establishing a connection to the backend.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on one whole, non-streamed generation.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Text generation backend.
#[async_trait]
pub trait Generator: Send + Sync + Debug {
    /// Generates the whole completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Streams the completion for `prompt` as text fragments.
    async fn generate_stream(&self, prompt: &str) -> Result<BoxStream<'static, Result<String>>>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One line of the backend's response.
#[derive(Debug, Default, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// [`Generator`] backed by an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaGenerator {
    /// Creates a generator from the analysis settings.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Network` if the HTTP client cannot be built.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SessionError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", config.url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if !stream {
            request = request.timeout(GENERATE_TIMEOUT);
        }
        let response = request.send().await.map_err(|e| unavailable(&e))?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Analysis backend rejected request");
            return Err(SessionError::network(format!("analysis backend returned HTTP {status}")));
        }
        Ok(response)
    }
}

fn unavailable(e: &impl Display) -> SessionError {
    SessionError::network(format!("analysis backend unavailable: {e}"))
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self.send(prompt, false).await?;
        let chunk: GenerateChunk = response.json().await.map_err(|e| unavailable(&e))?;
        if chunk.response.trim().is_empty() {
            return Err(SessionError::network("analysis backend returned an empty response"));
        }
        Ok(chunk.response)
    }

    async fn generate_stream(&self, prompt: &str) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.send(prompt, true).await?;
        Ok(ndjson_fragments(response.bytes_stream()))
    }
}

// ============================================================================
// NDJSON reader
// ============================================================================

struct LineReader<B, E> {
    body: BoxStream<'static, std::result::Result<B, E>>,
    pending: Vec<u8>,
    finished: bool,
}

/// What one complete line contributed.
enum Line {
    Skip,
    Fragment(String),
    Last(String),
}

fn parse_line(raw: &[u8]) -> Result<Line> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Line::Skip);
    }
    let chunk: GenerateChunk = serde_json::from_str(text)?;
    Ok(match (chunk.done, chunk.response.is_empty()) {
        (true, _) => Line::Last(chunk.response),
        (false, true) => Line::Skip,
        (false, false) => Line::Fragment(chunk.response),
    })
}

/// Turns a newline-delimited JSON body into its text fragments.
///
/// Lines may be split across reads. The stream ends after the line marked
/// `done`, at end of body, or after its first error.
pub fn ndjson_fragments<S, B, E>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = LineReader {
        body: body.boxed(),
        pending: Vec::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.finished {
                return None;
            }

            if let Some(newline) = reader.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.pending.drain(..=newline).collect();
                match parse_line(&line) {
                    Ok(Line::Skip) => continue,
                    Ok(Line::Fragment(text)) => return Some((Ok(text), reader)),
                    Ok(Line::Last(text)) => {
                        reader.finished = true;
                        if text.is_empty() {
                            return None;
                        }
                        return Some((Ok(text), reader));
                    }
                    Err(e) => {
                        reader.finished = true;
                        return Some((Err(e), reader));
                    }
                }
            }

            match reader.body.next().await {
                Some(Ok(bytes)) => reader.pending.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    reader.finished = true;
                    return Some((Err(unavailable(&e)), reader));
                }
                None => {
                    reader.finished = true;
                    debug!(trailing = reader.pending.len(), "Analysis stream ended");
                    return match parse_line(&reader.pending) {
                        Ok(Line::Fragment(text) | Line::Last(text)) if !text.is_empty() => {
                            Some((Ok(text), reader))
                        }
                        Ok(_) => None,
                        Err(e) => Some((Err(e), reader)),
                    };
                }
            }
        }
    })
    .boxed()
}

// ============================================================================
// Prompt
// ============================================================================

fn kind_label(kind: QuestionKind) -> &'static str {
    match kind {
        QuestionKind::SingleChoice => "单选题",
        QuestionKind::MultipleChoice => "多选题",
        QuestionKind::TrueFalse => "判断题",
        QuestionKind::FillBlank => "填空题",
        QuestionKind::ShortAnswer => "简答题",
    }
}

fn or_placeholder<'a>(value: Option<&'a str>, placeholder: &'a str) -> &'a str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or(placeholder)
}

/// Builds the tutoring prompt for one graded question.
///
/// Only the last `history_limit` chat turns are included and blank turns are
/// skipped. The prompt ends with the assistant's turn marker.
#[must_use]
pub fn build_prompt(context: &ExplainContext, history: &[ChatMessage], history_limit: usize) -> String {
    let question = &context.question;
    let item = &context.item;
    let has_options = !question.options.is_empty();

    let mut prompt = String::from("你是一名严谨且耐心的考试讲解老师，用中文回答。");
    prompt.push_str("\n请对学生给出清晰、分点的讲解，包含：");
    prompt.push_str("\n- 正确答案与结论");
    prompt.push_str("\n- 关键考点");
    prompt.push_str("\n- 推理/计算过程（简洁但完整）");
    prompt.push_str("\n- 为什么我的答案对/错，并指出易错点");
    if has_options {
        prompt.push_str("\n- 选项对比（为什么其他选项不对/不完整）");
    }

    prompt.push_str("\n\n【试题信息】");
    // Writing to a String cannot fail
    let _ = write!(prompt, "\n考试：{}", context.exam_name);
    let _ = write!(prompt, "\n题型：{}", kind_label(item.kind));
    let _ = write!(prompt, "\n题干：{}", question.stem);
    if has_options {
        prompt.push_str("\n选项：");
        for (label, option) in ('A'..='Z').zip(&question.options) {
            let _ = write!(prompt, "\n{label}. {option}");
        }
    }
    let _ = write!(prompt, "\n我的答案：{}", or_placeholder(item.answer.as_deref(), "(未作答)"));
    let _ = write!(prompt, "\n正确答案：{}", or_placeholder(item.correct_answer.as_deref(), "(空)"));
    let _ = write!(prompt, "\n是否正确：{}", if item.correct { "正确" } else { "错误" });
    let _ = write!(prompt, "\n得分：{}/{}", item.earned_score, item.max_score);

    let recent = &history[history.len().saturating_sub(history_limit)..];
    if !recent.is_empty() {
        prompt.push_str("\n\n【对话历史】");
        for turn in recent.iter().filter(|t| !t.content.trim().is_empty()) {
            let speaker = if turn.role.eq_ignore_ascii_case("assistant") {
                "助手"
            } else {
                "用户"
            };
            let _ = write!(prompt, "\n{speaker}：{}", turn.content);
        }
    }

    prompt.push_str("\n\n助手：");
    prompt
}
