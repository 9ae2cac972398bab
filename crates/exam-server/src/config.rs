//! Configuration for the reference session store.
//!
//! Exams, their questions and the student roster are read-only and come
//! from `exam-server.json`; there is no authoring API.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use exam_session::{Exam, ExamId, Question, QuestionKind, Result, SessionError, StudentIdentity};
use serde::{Deserialize, Serialize};

/// Name of the server configuration file.
pub const CONFIG_FILE: &str = "exam-server.json";

/// Default HTTP port.
const fn default_port() -> u16 {
    8080
}

/// Default bind address.
fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Default seconds between maintenance sweeps.
const fn default_maintenance_interval() -> u64 {
    60
}

/// Default capacity of the monitor feed.
const fn default_feed_capacity() -> usize {
    100
}

fn default_analysis_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_analysis_model() -> String {
    "qwen2".to_string()
}

/// Default number of chat turns forwarded to the analysis backend.
const fn default_history_limit() -> usize {
    20
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind. Zero picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between sweeps that auto-submit attempts of closed exams.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Per-subscriber buffer of the teacher monitor feed.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,

    /// Explanation backend.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Usernames allowed on teacher routes. Empty means any credential.
    #[serde(default)]
    pub teachers: Vec<String>,

    /// Students allowed to start exams. Empty means any credential.
    #[serde(default)]
    pub roster: Vec<StudentIdentity>,

    /// Exams on offer.
    #[serde(default)]
    pub exams: Vec<ExamDefinition>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            maintenance_interval_secs: default_maintenance_interval(),
            feed_capacity: default_feed_capacity(),
            analysis: AnalysisConfig::default(),
            teachers: Vec::new(),
            roster: Vec::new(),
            exams: Vec::new(),
        }
    }
}

/// An exam together with the questions of its paper, in paper order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamDefinition {
    /// The exam arrangement.
    #[serde(flatten)]
    pub exam: Exam,
    /// Questions with their answer keys.
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// Settings for the external explanation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    /// Base URL of an Ollama-compatible `/api/generate` endpoint.
    #[serde(default = "default_analysis_url")]
    pub url: String,

    /// Model name sent with every request.
    #[serde(default = "default_analysis_model")]
    pub model: String,

    /// How many of the most recent chat turns go into the prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            url: default_analysis_url(),
            model: default_analysis_model(),
            history_limit: default_history_limit(),
        }
    }
}

impl ServerConfig {
    /// Loads `exam-server.json` from `dir`.
    ///
    /// # Errors
    ///
    /// See [`ServerConfig::load_from_file`].
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE))
    }

    /// Loads configuration from a file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigParseError` if the file cannot be read or
    /// parsed, and `SessionError::ConfigValidationError` if a value is out of
    /// range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(SessionError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| SessionError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval_secs == 0 {
            return Err(SessionError::config_validation(
                "maintenanceIntervalSecs must be greater than 0",
                "Set maintenanceIntervalSecs to at least 1 in your exam-server.json",
            ));
        }

        if self.feed_capacity == 0 {
            return Err(SessionError::config_validation(
                "feedCapacity must be greater than 0",
                "Set feedCapacity to at least 1 in your exam-server.json",
            ));
        }

        if self.analysis.model.trim().is_empty() {
            return Err(SessionError::config_validation(
                "analysis.model cannot be empty",
                "Name the model served by the analysis backend, e.g. \"qwen2\"",
            ));
        }

        let mut exam_ids = HashSet::new();
        for definition in &self.exams {
            if !exam_ids.insert(definition.exam.id) {
                return Err(SessionError::config_validation(
                    format!("exam id {} is used more than once", definition.exam.id),
                    "Give every exam a unique id",
                ));
            }
            definition.validate()?;
        }

        Ok(())
    }

    /// Heartbeat of the maintenance sweep.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Looks up an exam definition.
    #[must_use]
    pub fn exam(&self, exam_id: ExamId) -> Option<&ExamDefinition> {
        self.exams.iter().find(|d| d.exam.id == exam_id)
    }
}

impl ExamDefinition {
    fn validate(&self) -> Result<()> {
        let exam = &self.exam;
        if exam.start_at >= exam.end_at {
            return Err(SessionError::config_validation(
                format!("exam {} ends before it starts", exam.id),
                "Make endAt later than startAt",
            ));
        }

        if exam.settings.attempt_limit == 0 {
            return Err(SessionError::config_validation(
                format!("exam {} has attemptLimit 0", exam.id),
                "Set settings.attemptLimit to at least 1",
            ));
        }

        if self.questions.is_empty() {
            return Err(SessionError::config_validation(
                format!("exam {} has no questions", exam.id),
                "Add at least one question to the exam",
            ));
        }

        let mut question_ids = HashSet::new();
        for question in &self.questions {
            if !question_ids.insert(question.id) {
                return Err(SessionError::config_validation(
                    format!("question {} appears twice in exam {}", question.id, exam.id),
                    "List every question once per exam",
                ));
            }
            let is_choice = matches!(
                question.kind,
                QuestionKind::SingleChoice | QuestionKind::MultipleChoice
            );
            if is_choice && question.options.len() < 2 {
                return Err(SessionError::config_validation(
                    format!("choice question {} needs at least two options", question.id),
                    "Add options or change the question type",
                ));
            }
        }

        Ok(())
    }
}
