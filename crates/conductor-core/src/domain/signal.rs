//! Records exchanged over the progress channel.
//!
//! Progress entries are advisory and never decide status. A completion
//! signal is the single terminal record a session publishes for its task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CompletionNotes, SessionId, SignalId, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    Progress {
        percent: u8,
        message: String,
    },
    /// Liveness only.
    Heartbeat,
}

/// One line of a task's append-only progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEntry {
    pub fn progress(
        task_id: TaskId,
        session_id: SessionId,
        timestamp: DateTime<Utc>,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            session_id,
            timestamp,
            kind: ProgressKind::Progress {
                percent: percent.min(100),
                message: message.into(),
            },
        }
    }

    pub fn heartbeat(task_id: TaskId, session_id: SessionId, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id,
            session_id,
            timestamp,
            kind: ProgressKind::Heartbeat,
        }
    }
}

/// Zero-based, half-open line range `[start, end)` of an artifact's base
/// content, replaced by `lines`. `start == end` is a pure insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl Hunk {
    pub fn new(start: usize, end: usize, lines: Vec<String>) -> Self {
        Self { start, end, lines }
    }

    pub fn is_insertion(&self) -> bool {
        self.start == self.end
    }

    /// Two hunks overlap when their replaced ranges intersect, when both
    /// insert at the same line, or when one inserts strictly inside the
    /// other's range.
    pub fn overlaps(&self, other: &Hunk) -> bool {
        match (self.is_insertion(), other.is_insertion()) {
            (true, true) => self.start == other.start,
            (true, false) => other.start < self.start && self.start < other.end,
            (false, true) => self.start < other.start && other.start < self.end,
            (false, false) => self.start.max(other.start) < self.end.min(other.end),
        }
    }
}

/// An artifact touched by a task.
///
/// `hunks == None` means the worker only reported the path, so nothing is
/// known about which region changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FileChangeRepr", into = "FileChangeRepr")]
pub struct FileChange {
    pub path: String,
    pub hunks: Option<Vec<Hunk>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum FileChangeRepr {
    Path(String),
    Detailed { path: String, hunks: Vec<Hunk> },
}

impl From<FileChangeRepr> for FileChange {
    fn from(repr: FileChangeRepr) -> Self {
        match repr {
            FileChangeRepr::Path(path) => FileChange { path, hunks: None },
            FileChangeRepr::Detailed { path, hunks } => FileChange {
                path,
                hunks: Some(hunks),
            },
        }
    }
}

impl From<FileChange> for FileChangeRepr {
    fn from(change: FileChange) -> Self {
        match change.hunks {
            None => FileChangeRepr::Path(change.path),
            Some(hunks) => FileChangeRepr::Detailed {
                path: change.path,
                hunks,
            },
        }
    }
}

impl FileChange {
    pub fn path_only(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hunks: None,
        }
    }

    pub fn with_hunks(path: impl Into<String>, hunks: Vec<Hunk>) -> Self {
        Self {
            path: path.into(),
            hunks: Some(hunks),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Success,
    Failure,
}

/// Terminal record for one session of a task. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSignal {
    pub signal_id: SignalId,
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub status: SignalStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default)]
    pub files_changed: Vec<FileChange>,

    #[serde(default)]
    pub design_decisions: Vec<String>,

    #[serde(default)]
    pub next_tasks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing: Option<String>,

    /// Captured error context for `failure` signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl CompletionSignal {
    /// The structured notes a successful signal carries.
    pub fn completion_notes(&self) -> CompletionNotes {
        CompletionNotes {
            summary: self.summary.clone().unwrap_or_default(),
            files_changed: self.files_changed.iter().map(|f| f.path.clone()).collect(),
            design_decisions: self.design_decisions.clone(),
            next_tasks: self.next_tasks.clone(),
            testing: self.testing.clone(),
        }
    }
}

/// What a worker reports when it finishes successfully.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<FileChange>,
    #[serde(default)]
    pub design_decisions: Vec<String>,
    #[serde(default)]
    pub next_tasks: Vec<String>,
    #[serde(default)]
    pub testing: Option<String>,
}

impl CompletionReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_change(mut self, change: FileChange) -> Self {
        self.files_changed.push(change);
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.design_decisions.push(decision.into());
        self
    }
}

/// Output of a completed dependency, handed to the worker of a dependent task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyArtifact {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub design_decisions: Vec<String>,
    #[serde(default)]
    pub next_tasks: Vec<String>,
}

impl From<&CompletionSignal> for DependencyArtifact {
    fn from(signal: &CompletionSignal) -> Self {
        Self {
            task_id: signal.task_id.clone(),
            summary: signal.summary.clone(),
            files_changed: signal.files_changed.iter().map(|f| f.path.clone()).collect(),
            design_decisions: signal.design_decisions.clone(),
            next_tasks: signal.next_tasks.clone(),
        }
    }
}

impl DependencyArtifact {
    /// Artifact of a dependency completed by hand, without a signal.
    pub fn from_notes(task_id: TaskId, notes: &CompletionNotes) -> Self {
        Self {
            task_id,
            summary: Some(notes.summary.clone()),
            files_changed: notes.files_changed.clone(),
            design_decisions: notes.design_decisions.clone(),
            next_tasks: notes.next_tasks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn hunk(start: usize, end: usize) -> Hunk {
        Hunk::new(start, end, vec!["x".to_string()])
    }

    #[rstest]
    #[case::disjoint(hunk(0, 2), hunk(2, 4), false)]
    #[case::intersecting(hunk(0, 3), hunk(2, 4), true)]
    #[case::same_range(hunk(5, 6), hunk(5, 6), true)]
    #[case::contained(hunk(1, 9), hunk(3, 4), true)]
    #[case::insert_at_same_line(hunk(3, 3), hunk(3, 3), true)]
    #[case::insert_inside_range(hunk(4, 4), hunk(2, 6), true)]
    #[case::insert_at_range_start(hunk(2, 2), hunk(2, 6), false)]
    #[case::insert_at_range_end(hunk(6, 6), hunk(2, 6), false)]
    fn hunk_overlap_table(#[case] a: Hunk, #[case] b: Hunk, #[case] expected: bool) {
        assert_eq!(a.overlaps(&b), expected);
        assert_eq!(b.overlaps(&a), expected);
    }

    #[test]
    fn file_change_accepts_bare_paths_and_hunks() {
        let json = r#"["src/a.rs", {"path": "src/b.rs", "hunks": [{"start": 1, "end": 2, "lines": ["y"]}]}]"#;
        let changes: Vec<FileChange> = serde_json::from_str(json).unwrap();
        assert_eq!(changes[0], FileChange::path_only("src/a.rs"));
        assert_eq!(changes[1].hunks.as_ref().unwrap()[0].end, 2);

        let back = serde_json::to_value(&changes).unwrap();
        assert_eq!(back[0], "src/a.rs");
        assert_eq!(back[1]["path"], "src/b.rs");
    }

    #[test]
    fn progress_entry_is_flat_json() {
        let entry = ProgressEntry::progress(
            TaskId::new("T1"),
            SessionId::from_ulid(Ulid::new()),
            Utc::now(),
            150,
            "halfway",
        );
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["kind"], "progress");
        assert_eq!(v["percent"], 100);
        assert_eq!(v["taskId"], "T1");
    }
}
