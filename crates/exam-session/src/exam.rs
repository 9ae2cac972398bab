//! Exam arrangements, settings, and question snapshots.
//!
//! Exams and their questions are owned by collaborators outside this crate;
//! the core only reads them. [`QuestionSnapshot`] is the student-facing copy
//! of a question and has no field that could carry the correct answer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::{AttemptStatus, ExamId, PaperId, QuestionId};

/// When students may see correct answers and explanations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnswerVisibility {
    /// Never.
    None,
    /// Once the student's attempt is terminal.
    #[default]
    AfterSubmission,
    /// Once the exam window has closed.
    AfterDeadline,
}

const fn default_attempt_limit() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

/// Per-exam policy. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSettings {
    /// Time limit per attempt; `None` means the exam window is the limit.
    #[serde(default)]
    pub duration_minutes: Option<u32>,

    /// Maximum attempts per student.
    #[serde(default = "default_attempt_limit")]
    pub attempt_limit: u32,

    /// Shuffle question order per attempt.
    #[serde(default)]
    pub shuffle_questions: bool,

    /// Shuffle option order per attempt.
    #[serde(default)]
    pub shuffle_options: bool,

    /// Return the existing in-progress attempt when `start` is called again.
    #[serde(default = "default_true")]
    pub allow_resume: bool,

    /// Send heartbeats while the attempt is in progress.
    #[serde(default = "default_true")]
    pub enable_heartbeat: bool,

    /// Report focus and visibility changes as proctor events.
    #[serde(default = "default_true")]
    pub record_tab_switch: bool,

    /// Auto-submit once the student has been away this many seconds.
    #[serde(default)]
    pub force_submit_on_leave_seconds: Option<u32>,

    /// Auto-submit when the countdown reaches zero.
    #[serde(default = "default_true")]
    pub auto_submit_on_timeout: bool,

    /// When answers become visible to students.
    #[serde(default)]
    pub show_answers: AnswerVisibility,
}

impl Default for ExamSettings {
    fn default() -> Self {
        Self {
            duration_minutes: None,
            attempt_limit: default_attempt_limit(),
            shuffle_questions: false,
            shuffle_options: false,
            allow_resume: true,
            enable_heartbeat: true,
            record_tab_switch: true,
            force_submit_on_leave_seconds: None,
            auto_submit_on_timeout: true,
            show_answers: AnswerVisibility::default(),
        }
    }
}

impl ExamSettings {
    /// Returns `true` if a student may see answers for an attempt with the
    /// given status at time `now`.
    #[must_use]
    pub fn answers_visible(&self, status: AttemptStatus, exam_end_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.show_answers {
            AnswerVisibility::None => false,
            AnswerVisibility::AfterSubmission => status.is_terminal(),
            AnswerVisibility::AfterDeadline => now > exam_end_at,
        }
    }
}

/// An exam arrangement: a paper offered during a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    /// Exam id.
    pub id: ExamId,
    /// Display name.
    pub name: String,
    /// The paper students answer.
    pub paper_id: PaperId,
    /// Window start.
    pub start_at: DateTime<Utc>,
    /// Window end.
    pub end_at: DateTime<Utc>,
    /// Exam policy.
    #[serde(default)]
    pub settings: ExamSettings,
}

impl Exam {
    /// Returns `true` if `now` lies within `[start_at, end_at]`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now <= self.end_at
    }

    /// Computes the deadline of an attempt started at `started_at`.
    ///
    /// With a duration configured this is
    /// `min(end_at, started_at + duration)`, otherwise `end_at`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use exam_session::{Exam, ExamSettings};
    ///
    /// let exam = Exam {
    ///     id: 1,
    ///     name: "Midterm".to_string(),
    ///     paper_id: 1,
    ///     start_at: Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
    ///     end_at: Utc.with_ymd_and_hms(2026, 6, 1, 11, 0, 0).unwrap(),
    ///     settings: ExamSettings {
    ///         duration_minutes: Some(30),
    ///         ..ExamSettings::default()
    ///     },
    /// };
    ///
    /// let started = Utc.with_ymd_and_hms(2026, 6, 1, 10, 55, 0).unwrap();
    /// assert_eq!(exam.effective_deadline(started), exam.end_at);
    /// ```
    #[must_use]
    pub fn effective_deadline(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        match self.settings.duration_minutes {
            Some(minutes) if minutes > 0 => {
                let by_duration = started_at + Duration::minutes(i64::from(minutes));
                by_duration.min(self.end_at)
            }
            _ => self.end_at,
        }
    }
}

/// The kind of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionKind {
    /// Exactly one option is correct.
    SingleChoice,
    /// Any number of options may be correct.
    MultipleChoice,
    /// True or false.
    TrueFalse,
    /// Free text filling one or more blanks.
    FillBlank,
    /// Free-form written answer.
    ShortAnswer,
}

/// A source question as held by the question bank, including its answer.
///
/// Never sent to students; convert with [`QuestionSnapshot::capture`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// Question id.
    pub id: QuestionId,
    /// Question kind.
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// Question text.
    pub stem: String,
    /// Options in authoring order.
    #[serde(default)]
    pub options: Vec<String>,
    /// Points awarded.
    pub score: u32,
    /// Correct answer.
    #[serde(default)]
    pub answer: Option<String>,
}

/// Immutable per-attempt copy of a question, safe to show a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSnapshot {
    /// Question id.
    pub id: QuestionId,
    /// Question kind.
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// Question text.
    pub stem: String,
    /// Options in presentation order.
    pub options: Vec<String>,
    /// Points awarded.
    pub score: u32,
}

impl QuestionSnapshot {
    /// Copies the student-visible parts of a question.
    #[must_use]
    pub fn capture(question: &Question) -> Self {
        Self {
            id: question.id,
            kind: question.kind,
            stem: question.stem.clone(),
            options: question.options.clone(),
            score: question.score,
        }
    }
}

/// Roster metadata for one student, used to label monitor rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIdentity {
    /// Login name.
    pub username: String,
    /// Full name, if known.
    #[serde(default)]
    pub full_name: Option<String>,
    /// Student number, if known.
    #[serde(default)]
    pub student_no: Option<String>,
}
