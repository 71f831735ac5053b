//! Critical path: the dependency chain with the largest total effort.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskStatus};

use super::DependencyGraph;

/// Which chain wins when two chains carry the same effort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The task defined first in the sprint file wins.
    #[default]
    FirstDefined,
    /// The smaller task id wins.
    Lexicographic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPath {
    /// Ordered from the first task to run to the last.
    pub path: Vec<TaskId>,
    pub total_effort: f64,
}

impl CriticalPath {
    pub fn contains(&self, id: &TaskId) -> bool {
        self.path.contains(id)
    }

    /// Position of `id` on the path, if it is on it.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.path.iter().position(|p| p == id)
    }
}

impl DependencyGraph {
    /// Longest chain by cumulative `estimatedEffort` over the whole sprint.
    pub fn critical_path(&self, default_effort: f64, tie_break: TieBreak) -> CriticalPath {
        self.longest_chain(|i| self.effort(i, default_effort), tie_break)
    }

    /// Longest chain over work that is not completed yet. Completed tasks
    /// weigh nothing and are left off the path.
    pub fn remaining_critical_path(
        &self,
        statuses: &HashMap<TaskId, TaskStatus>,
        default_effort: f64,
        tie_break: TieBreak,
    ) -> CriticalPath {
        let done = |i: usize| statuses.get(&self.ids[i]) == Some(&TaskStatus::Completed);
        let mut cp = self.longest_chain(
            |i| if done(i) { 0.0 } else { self.effort(i, default_effort) },
            tie_break,
        );
        cp.path.retain(|id| statuses.get(id) != Some(&TaskStatus::Completed));
        cp
    }

    fn effort(&self, i: usize, default_effort: f64) -> f64 {
        self.efforts[i].unwrap_or(default_effort).max(0.0)
    }

    /// `true` when node `a` beats node `b` on a tie.
    fn wins_tie(&self, a: usize, b: usize, tie_break: TieBreak) -> bool {
        match tie_break {
            TieBreak::FirstDefined => a < b,
            TieBreak::Lexicographic => self.ids[a] < self.ids[b],
        }
    }

    fn better(&self, a: (usize, f64), b: (usize, f64), tie_break: TieBreak) -> bool {
        match a.1.partial_cmp(&b.1) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) | None => false,
            Some(Ordering::Equal) => self.wins_tie(a.0, b.0, tie_break),
        }
    }

    /// Dynamic programming over a topological order:
    /// `finish[n] = weight(n) + max(finish[dep])`.
    fn longest_chain(&self, weight: impl Fn(usize) -> f64, tie_break: TieBreak) -> CriticalPath {
        if self.ids.is_empty() {
            return CriticalPath::default();
        }
        let mut finish = vec![0.0_f64; self.ids.len()];
        let mut pred: Vec<Option<usize>> = vec![None; self.ids.len()];

        for id in self.topological_order() {
            let node = self.index[&id];
            let mut best: Option<(usize, f64)> = None;
            for &dep in &self.edges[node] {
                let candidate = (dep, finish[dep]);
                if best.is_none_or(|b| self.better(candidate, b, tie_break)) {
                    best = Some(candidate);
                }
            }
            finish[node] = weight(node) + best.map_or(0.0, |(_, f)| f);
            pred[node] = best.map(|(dep, _)| dep);
        }

        let mut end = 0;
        for node in 1..self.ids.len() {
            if self.better((node, finish[node]), (end, finish[end]), tie_break) {
                end = node;
            }
        }

        let mut path = vec![self.ids[end].clone()];
        let mut current = end;
        while let Some(prev) = pred[current] {
            path.push(self.ids[prev].clone());
            current = prev;
        }
        path.reverse();

        CriticalPath {
            path,
            total_effort: finish[end],
        }
    }
}
