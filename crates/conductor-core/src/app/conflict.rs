//! ConflictResolver: line-range merging of artifacts several tasks edited.
//!
//! Workers report edits as hunks against an artifact's base content and
//! the resolver is the one writer of the merged result. The base is
//! snapshotted the first time any task touches the artifact. Every later
//! edit is checked against the edits accepted before it:
//!
//! - disjoint hunks are merged and the artifact is rewritten as
//!   base + all accepted hunks
//! - overlapping hunks raise a [`ConflictError`], leave the artifact at its
//!   last merged content and flag the sprint until [`ConflictResolver::resolve`]
//! - a whole-file touch (no hunks) conflicts with any other touch
//!
//! Tasks are never reverted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::SprintLog;
use crate::domain::{ConflictError, FileChange, Hunk, OverlapRegion, SprintEvent, TaskId};
use crate::ports::ArtifactStore;

#[derive(Debug, Clone)]
struct AcceptedEdit {
    task_id: TaskId,
    /// `None` for a whole-file touch.
    hunks: Option<Vec<Hunk>>,
}

#[derive(Debug, Clone, Default)]
struct ArtifactState {
    base: Vec<String>,
    trailing_newline: bool,
    accepted: Vec<AcceptedEdit>,
    unresolved: Vec<ConflictError>,
}

impl ArtifactState {
    fn from_content(content: Option<&str>) -> Self {
        let content = content.unwrap_or_default();
        Self {
            base: content.lines().map(str::to_string).collect(),
            trailing_newline: content.is_empty() || content.ends_with('\n'),
            ..Self::default()
        }
    }

    /// Base with every accepted hunk applied.
    fn render(&self) -> String {
        let mut hunks: Vec<&Hunk> = self
            .accepted
            .iter()
            .filter_map(|e| e.hunks.as_ref())
            .flatten()
            .collect();
        // insertions go before a replacement starting at the same line
        hunks.sort_by_key(|h| (h.start, !h.is_insertion()));

        let mut lines: Vec<&str> = Vec::with_capacity(self.base.len());
        let mut cursor = 0;
        for hunk in hunks {
            lines.extend(self.base[cursor..hunk.start].iter().map(String::as_str));
            lines.extend(hunk.lines.iter().map(String::as_str));
            cursor = hunk.end;
        }
        lines.extend(self.base[cursor..].iter().map(String::as_str));

        let mut out = lines.join("\n");
        if self.trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// First accepted edit the new one collides with.
    fn collision(&self, edit: &AcceptedEdit) -> Option<ConflictError> {
        self.accepted.iter().find_map(|prior| {
            let region = match (&prior.hunks, &edit.hunks) {
                (Some(a), Some(b)) => overlap(a, b)?,
                _ => OverlapRegion::WholeFile,
            };
            Some(ConflictError {
                artifact: String::new(),
                task_a: prior.task_id.clone(),
                task_b: edit.task_id.clone(),
                overlap_region: region,
            })
        })
    }
}

/// Region covered by the first overlapping pair of hunks.
fn overlap(a: &[Hunk], b: &[Hunk]) -> Option<OverlapRegion> {
    a.iter().find_map(|x| {
        b.iter().find(|y| x.overlaps(y)).map(|y| OverlapRegion::Lines {
            start: x.start.min(y.start),
            end: x.end.max(y.end),
        })
    })
}

/// Range of the first hunk that cannot be applied to a base of `base_len`
/// lines: reversed, past the end, or overlapping another hunk of the same task.
fn malformed(hunks: &[Hunk], base_len: usize) -> Option<(usize, usize)> {
    for h in hunks {
        if h.start > h.end || h.end > base_len {
            return Some((h.start, h.end));
        }
    }
    let mut sorted: Vec<&Hunk> = hunks.iter().collect();
    sorted.sort_by_key(|h| (h.start, h.end));
    sorted.windows(2).find_map(|w| {
        w[0].overlaps(w[1])
            .then(|| (w[0].start.min(w[1].start), w[0].end.max(w[1].end)))
    })
}

/// What one accepted completion did to the artifacts it touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Artifacts rewritten (or first recorded) with the task's edits.
    pub merged: Vec<String>,
    pub conflicts: Vec<ConflictError>,
    /// Artifacts that could not be read or written, with the error.
    pub skipped: Vec<(String, String)>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.skipped.is_empty()
    }
}

pub struct ConflictResolver {
    artifacts: Arc<dyn ArtifactStore>,
    log: SprintLog,
    state: BTreeMap<String, ArtifactState>,
}

impl ConflictResolver {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, log: SprintLog) -> Self {
        Self {
            artifacts,
            log,
            state: BTreeMap::new(),
        }
    }

    /// Merge the artifacts `task_id` reports as changed.
    pub async fn apply(&mut self, task_id: &TaskId, changes: &[FileChange]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for (path, hunks) in group_by_path(changes) {
            let edit = AcceptedEdit {
                task_id: task_id.clone(),
                hunks,
            };
            match self.apply_one(&path, edit).await {
                Ok(None) => outcome.merged.push(path),
                Ok(Some(conflict)) => outcome.conflicts.push(conflict),
                Err(message) => {
                    warn!(task_id = %task_id, artifact = %path, error = %message, "artifact skipped");
                    outcome.skipped.push((path, message));
                }
            }
        }
        outcome
    }

    async fn apply_one(
        &mut self,
        path: &str,
        edit: AcceptedEdit,
    ) -> Result<Option<ConflictError>, String> {
        if !self.state.contains_key(path) {
            let current = self.artifacts.read(path).await.map_err(|e| e.to_string())?;
            self.state
                .insert(path.to_string(), ArtifactState::from_content(current.as_deref()));
        }
        let Some(state) = self.state.get_mut(path) else {
            return Ok(None);
        };

        let rejection = match &edit.hunks {
            Some(hunks) => malformed(hunks, state.base.len()).map(|(start, end)| ConflictError {
                artifact: path.to_string(),
                task_a: edit.task_id.clone(),
                task_b: edit.task_id.clone(),
                overlap_region: OverlapRegion::Lines { start, end },
            }),
            None => None,
        };
        let conflict = rejection.or_else(|| {
            state.collision(&edit).map(|mut c| {
                c.artifact = path.to_string();
                c
            })
        });
        if let Some(conflict) = conflict {
            warn!(
                artifact = %path,
                task_a = %conflict.task_a,
                task_b = %conflict.task_b,
                region = %conflict.overlap_region,
                "conflicting edits"
            );
            state.unresolved.push(conflict.clone());
            self.log
                .emit(SprintEvent::ConflictRaised {
                    artifact: conflict.artifact.clone(),
                    task_a: conflict.task_a.clone(),
                    task_b: conflict.task_b.clone(),
                    overlap_region: conflict.overlap_region.clone(),
                })
                .await;
            return Ok(Some(conflict));
        }

        let merged_with: Vec<TaskId> = state.accepted.iter().map(|e| e.task_id.clone()).collect();
        let rewrite = edit.hunks.is_some();
        let task_id = edit.task_id.clone();
        state.accepted.push(edit);
        if rewrite {
            let merged = state.render();
            if let Err(e) = self.artifacts.write(path, &merged).await {
                // keep the last merged content authoritative
                if let Some(state) = self.state.get_mut(path) {
                    state.accepted.pop();
                }
                return Err(e.to_string());
            }
        }

        info!(artifact = %path, task_id = %task_id, merged_with = merged_with.len(), "artifact merged");
        self.log
            .emit(SprintEvent::MergeRecorded {
                artifact: path.to_string(),
                task_id,
                merged_with,
            })
            .await;
        Ok(None)
    }

    /// Clear the conflicts on `artifact` after it was reconciled by hand.
    /// Its current content becomes the new base. Returns `false` when the
    /// artifact had no unresolved conflict.
    pub async fn resolve(&mut self, artifact: &str) -> Result<bool, String> {
        let had_conflicts = self
            .state
            .get(artifact)
            .is_some_and(|s| !s.unresolved.is_empty());
        if !had_conflicts {
            return Ok(false);
        }
        let current = self
            .artifacts
            .read(artifact)
            .await
            .map_err(|e| e.to_string())?;
        let mut rebased = ArtifactState::from_content(current.as_deref());
        if let Some(state) = self.state.get(artifact) {
            // whoever touched it before still counts as having touched it
            rebased.accepted = state
                .accepted
                .iter()
                .map(|e| AcceptedEdit {
                    task_id: e.task_id.clone(),
                    hunks: Some(Vec::new()),
                })
                .collect();
        }
        self.state.insert(artifact.to_string(), rebased);
        info!(artifact = %artifact, "conflict resolved");
        self.log
            .emit(SprintEvent::ConflictResolved {
                artifact: artifact.to_string(),
            })
            .await;
        Ok(true)
    }

    pub fn has_unresolved_conflicts(&self) -> bool {
        self.state.values().any(|s| !s.unresolved.is_empty())
    }

    pub fn unresolved(&self) -> Vec<ConflictError> {
        self.state
            .values()
            .flat_map(|s| s.unresolved.iter().cloned())
            .collect()
    }
}

/// One entry per path. A path listed twice by the same task merges its
/// hunks; any bare-path entry makes the whole touch whole-file.
fn group_by_path(changes: &[FileChange]) -> Vec<(String, Option<Vec<Hunk>>)> {
    let mut grouped: Vec<(String, Option<Vec<Hunk>>)> = Vec::new();
    for change in changes {
        match grouped.iter_mut().find(|(p, _)| *p == change.path) {
            Some((_, slot)) => {
                *slot = match (slot.take(), &change.hunks) {
                    (Some(mut a), Some(b)) => {
                        a.extend(b.iter().cloned());
                        Some(a)
                    }
                    _ => None,
                };
            }
            None => grouped.push((change.path.clone(), change.hunks.clone())),
        }
    }
    grouped
}
