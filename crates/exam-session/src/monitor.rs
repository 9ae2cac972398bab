//! Teacher-side monitor projection.
//!
//! [`aggregate`] turns the store's raw attempts, heartbeats and events into
//! a [`MonitorSnapshot`]. The snapshot is recomputed for every request and is
//! never stored. Filters and highlights only affect rows; the counts always
//! cover every attempt of the exam.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::attempt::{Attempt, AttemptId, AttemptStatus, ExamId};
use crate::exam::StudentIdentity;
use crate::proctor::{EventId, EventKind, Heartbeat, ProctorEvent};

/// Number of most recent events included in a snapshot.
pub const RECENT_EVENT_LIMIT: usize = 50;

// ============================================================================
// Query
// ============================================================================

/// Row filter by attempt status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusFilter {
    /// Every student.
    #[default]
    All,
    /// Students whose latest attempt is in progress.
    InProgress,
    /// Students whose latest attempt is terminal.
    Submitted,
}

impl StatusFilter {
    fn admits(self, status: AttemptStatus) -> bool {
        match self {
            Self::All => true,
            Self::InProgress => status == AttemptStatus::InProgress,
            Self::Submitted => status.is_terminal(),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" | "" => Ok(Self::All),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUBMITTED" => Ok(Self::Submitted),
            other => Err(format!(
                "invalid status filter '{other}': expected one of ALL, IN_PROGRESS, SUBMITTED"
            )),
        }
    }
}

/// What the teacher asked to see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorQuery {
    /// Status filter.
    #[serde(default)]
    pub filter: StatusFilter,
    /// Substring matched against username, full name and student number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    /// Usernames to flag. Carried as a comma-separated list on the wire.
    #[serde(
        default,
        rename = "highlight",
        serialize_with = "join_usernames",
        deserialize_with = "split_usernames",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub highlighted: BTreeSet<String>,
}

impl MonitorQuery {
    /// Keyword after trimming; `None` when blank.
    fn needle(&self) -> Option<String> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase)
    }
}

fn join_usernames<S: Serializer>(set: &BTreeSet<String>, serializer: S) -> Result<S::Ok, S::Error> {
    let joined = set.iter().map(String::as_str).collect::<Vec<_>>().join(",");
    serializer.serialize_str(&joined)
}

fn split_usernames<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect())
}

// ============================================================================
// Snapshot
// ============================================================================

/// Attempt counts over the whole exam.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorCounts {
    /// Every attempt ever started.
    pub started: usize,
    /// Attempts in progress.
    pub in_progress: usize,
    /// Terminal attempts.
    pub submitted: usize,
    /// Attempts with a grading result.
    pub graded: usize,
}

/// Short form of the latest event of a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBrief {
    /// Event id.
    pub id: EventId,
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

/// One student in the monitor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    /// Login name.
    pub username: String,
    /// Full name, or the username when unknown.
    pub display_name: String,
    /// Student number, if known.
    pub student_no: Option<String>,
    /// Latest attempt, if any.
    pub attempt_id: Option<AttemptId>,
    /// Status of the latest attempt.
    pub status: AttemptStatus,
    /// Most recent heartbeat timestamp.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Most recent event.
    pub last_event: Option<EventBrief>,
    /// Completed away-and-back cycles.
    pub tab_switches: u32,
    /// Total time away, rounded to seconds.
    pub away_seconds: u64,
    /// Flagged by the caller.
    pub highlighted: bool,
}

/// Read-only monitor view of one exam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    /// The exam.
    pub exam_id: ExamId,
    /// When the snapshot was computed.
    pub generated_at: DateTime<Utc>,
    /// Counts over every attempt.
    pub counts: MonitorCounts,
    /// Usernames with an in-progress attempt, sorted.
    pub in_progress_users: Vec<String>,
    /// Usernames with a terminal attempt, sorted.
    pub submitted_users: Vec<String>,
    /// Rows after filtering, sorted by student number then username.
    pub rows: Vec<StudentRow>,
    /// The most recent events, newest first.
    pub recent_events: Vec<ProctorEvent>,
}

/// Raw store records for one exam.
#[derive(Debug, Clone, Copy)]
pub struct MonitorRecords<'a> {
    /// Every attempt of the exam.
    pub attempts: &'a [Attempt],
    /// Latest heartbeat per attempt.
    pub heartbeats: &'a [Heartbeat],
    /// Proctor events of the exam.
    pub events: &'a [ProctorEvent],
    /// Roster of students allowed to take the exam.
    pub identities: &'a [StudentIdentity],
    /// Number of graded results.
    pub graded: usize,
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Default)]
struct StudentFacts<'a> {
    latest_attempt: Option<&'a Attempt>,
    last_heartbeat: Option<DateTime<Utc>>,
    events: Vec<&'a ProctorEvent>,
}

/// Builds a monitor snapshot.
#[must_use]
pub fn aggregate(
    exam_id: ExamId,
    records: &MonitorRecords<'_>,
    query: &MonitorQuery,
    now: DateTime<Utc>,
) -> MonitorSnapshot {
    let mut counts = MonitorCounts {
        started: records.attempts.len(),
        graded: records.graded,
        ..MonitorCounts::default()
    };
    let mut in_progress_users = BTreeSet::new();
    let mut submitted_users = BTreeSet::new();

    let mut students: BTreeMap<&str, StudentFacts<'_>> = BTreeMap::new();
    for identity in records.identities {
        if !identity.username.trim().is_empty() {
            students.entry(identity.username.as_str()).or_default();
        }
    }

    let mut attempt_owner: HashMap<AttemptId, &str> = HashMap::new();
    for attempt in records.attempts {
        if attempt.status == AttemptStatus::InProgress {
            counts.in_progress += 1;
            in_progress_users.insert(attempt.username.clone());
        } else if attempt.status.is_terminal() {
            counts.submitted += 1;
            submitted_users.insert(attempt.username.clone());
        }
        attempt_owner.insert(attempt.id, attempt.username.as_str());

        let facts = students.entry(attempt.username.as_str()).or_default();
        if facts.latest_attempt.map_or(true, |a| attempt.id > a.id) {
            facts.latest_attempt = Some(attempt);
        }
    }

    for beat in records.heartbeats {
        let username = attempt_owner
            .get(&beat.attempt_id)
            .copied()
            .unwrap_or(beat.username.as_str());
        let facts = students.entry(username).or_default();
        if facts.last_heartbeat.map_or(true, |ts| beat.ts > ts) {
            facts.last_heartbeat = Some(beat.ts);
        }
    }

    for event in records.events {
        students
            .entry(event.username.as_str())
            .or_default()
            .events
            .push(event);
    }

    let identities: HashMap<&str, &StudentIdentity> = records
        .identities
        .iter()
        .map(|i| (i.username.as_str(), i))
        .collect();

    let needle = query.needle();
    let mut rows: Vec<StudentRow> = students
        .into_iter()
        .map(|(username, facts)| {
            build_row(username, facts, identities.get(username).copied(), query)
        })
        .filter(|row| query.filter.admits(row.status))
        .filter(|row| needle.as_deref().map_or(true, |k| row_matches(row, identities.get(row.username.as_str()).copied(), k)))
        .collect();

    rows.sort_by(compare_rows);

    let mut recent_events: Vec<ProctorEvent> = records.events.to_vec();
    recent_events.sort_by(|a, b| b.id.cmp(&a.id));
    recent_events.truncate(RECENT_EVENT_LIMIT);

    MonitorSnapshot {
        exam_id,
        generated_at: now,
        counts,
        in_progress_users: in_progress_users.into_iter().collect(),
        submitted_users: submitted_users.into_iter().collect(),
        rows,
        recent_events,
    }
}

fn build_row(
    username: &str,
    facts: StudentFacts<'_>,
    identity: Option<&StudentIdentity>,
    query: &MonitorQuery,
) -> StudentRow {
    let display_name = identity
        .and_then(|i| i.full_name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(username)
        .to_string();
    let student_no = identity
        .and_then(|i| i.student_no.clone())
        .filter(|n| !n.trim().is_empty());

    let (tab_switches, away_seconds) = tab_stats(&facts.events);
    let last_event = facts.events.iter().max_by_key(|e| e.id).map(|e| EventBrief {
        id: e.id,
        kind: e.kind.clone(),
        created_at: e.created_at,
    });

    StudentRow {
        username: username.to_string(),
        display_name,
        student_no,
        attempt_id: facts.latest_attempt.map(|a| a.id),
        status: facts
            .latest_attempt
            .map_or(AttemptStatus::NotStarted, |a| a.status),
        last_heartbeat: facts.last_heartbeat,
        last_event,
        tab_switches,
        away_seconds,
        highlighted: query.highlighted.contains(username),
    }
}

fn row_matches(row: &StudentRow, identity: Option<&StudentIdentity>, needle: &str) -> bool {
    let full_name = identity.and_then(|i| i.full_name.as_deref()).unwrap_or_default();
    let student_no = row.student_no.as_deref().unwrap_or_default();
    [row.username.as_str(), full_name, student_no]
        .iter()
        .any(|field| field.to_lowercase().contains(needle))
}

/// Student number ascending with blanks last, then username.
fn compare_rows(a: &StudentRow, b: &StudentRow) -> std::cmp::Ordering {
    match (&a.student_no, &b.student_no) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
    .then_with(|| a.username.cmp(&b.username))
}

/// Counts completed away periods and their total length.
///
/// A leave event opens a period unless one is already open; a return event
/// closes it.
fn tab_stats(events: &[&ProctorEvent]) -> (u32, u64) {
    let mut ordered: Vec<&ProctorEvent> = events.to_vec();
    ordered.sort_by_key(|e| (e.created_at, e.id));

    let mut switches = 0;
    let mut away_ms: i64 = 0;
    let mut away_since: Option<DateTime<Utc>> = None;

    for event in ordered {
        if event.kind.is_leave() {
            away_since.get_or_insert(event.created_at);
        } else if event.kind.is_return() {
            if let Some(since) = away_since.take() {
                away_ms += (event.created_at - since).num_milliseconds().max(0);
                switches += 1;
            }
        }
    }

    let seconds = u64::try_from((away_ms + 500) / 1000).unwrap_or(0);
    (switches, seconds)
}
