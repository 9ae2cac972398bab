//! Objective grading of submitted attempts.
//!
//! Choice and true/false questions are graded against the answer key. Free
//! text kinds always score zero here and are left to manual marking.

use exam_session::{AnswerSheet, AttemptId, Question, QuestionId, QuestionKind};
use serde::{Deserialize, Serialize};

/// Grade of one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    /// The graded question.
    pub question_id: QuestionId,
    /// Question kind.
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// What the student answered, if anything.
    pub answer: Option<String>,
    /// The answer key.
    pub correct_answer: Option<String>,
    /// Points available.
    pub max_score: u32,
    /// Points earned.
    pub earned_score: u32,
    /// Whether the answer matched the key.
    pub correct: bool,
}

/// Graded result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    /// The graded attempt.
    pub attempt_id: AttemptId,
    /// Total points earned.
    pub total_score: u32,
    /// Total points available.
    pub max_score: u32,
    /// Per-question grades in presentation order.
    pub items: Vec<ResultItem>,
}

impl ExamResult {
    /// Looks up the grade of one question.
    #[must_use]
    pub fn item(&self, question_id: QuestionId) -> Option<&ResultItem> {
        self.items.iter().find(|i| i.question_id == question_id)
    }
}

/// Grades `answers` against `questions`.
#[must_use]
pub fn grade(attempt_id: AttemptId, questions: &[Question], answers: &AnswerSheet) -> ExamResult {
    let items: Vec<ResultItem> = questions
        .iter()
        .map(|question| {
            let answer = answers.get(question.id).map(str::to_string);
            let correct = match (&answer, &question.answer) {
                (Some(given), Some(key)) => is_correct(question.kind, given, key),
                _ => false,
            };
            ResultItem {
                question_id: question.id,
                kind: question.kind,
                answer,
                correct_answer: question.answer.clone(),
                max_score: question.score,
                earned_score: if correct { question.score } else { 0 },
                correct,
            }
        })
        .collect();

    ExamResult {
        attempt_id,
        total_score: items.iter().map(|i| i.earned_score).sum(),
        max_score: items.iter().map(|i| i.max_score).sum(),
        items,
    }
}

/// Compares an answer with the key under the rules of its kind.
#[must_use]
pub fn is_correct(kind: QuestionKind, given: &str, key: &str) -> bool {
    match kind {
        QuestionKind::SingleChoice => given.trim().to_uppercase() == key.trim().to_uppercase(),
        QuestionKind::MultipleChoice => {
            let given = normalize_choices(given);
            !given.is_empty() && given == normalize_choices(key)
        }
        QuestionKind::TrueFalse => given.trim().to_lowercase() == key.trim().to_lowercase(),
        QuestionKind::FillBlank | QuestionKind::ShortAnswer => false,
    }
}

/// Canonical form of a multiple choice answer: distinct option letters,
/// sorted, comma separated. Anything that is not a single letter is dropped.
fn normalize_choices(raw: &str) -> String {
    let mut letters: Vec<char> = raw
        .split(',')
        .filter_map(|part| {
            let mut chars = part.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
                _ => None,
            }
        })
        .collect();
    letters.sort_unstable();
    letters.dedup();
    letters
        .iter()
        .map(char::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
