//! Dependency graph over the tasks of one sprint.
//!
//! Design:
//! - Nodes are indexed by definition order, so every listing is stable
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges are kept in sync and acyclic

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::domain::{CycleError, SchemaError, SchemaProblem, Task, TaskId, TaskStatus};

use super::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Task ids in definition order.
    pub(super) ids: Vec<TaskId>,
    pub(super) index: HashMap<TaskId, usize>,
    pub(super) efforts: Vec<Option<f64>>,

    /// Forward edges: node -> nodes it depends on.
    pub(super) edges: Vec<Vec<usize>>,

    /// Reverse edges: node -> nodes waiting for it.
    pub(super) reverse_edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph and prove it acyclic.
    ///
    /// Unknown or duplicate ids are schema errors; a back edge found by the
    /// depth-first search is reported as a cycle whose path starts and ends
    /// with the same task.
    pub fn build(tasks: &[Task]) -> Result<Self, BuildError> {
        let mut index = HashMap::with_capacity(tasks.len());
        let mut problems = Vec::new();
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                problems.push(SchemaProblem::new(
                    Some(task.id.to_string()),
                    Some("id"),
                    "duplicate task id",
                ));
            }
        }

        let mut edges = vec![Vec::new(); tasks.len()];
        let mut reverse_edges = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                match index.get(dep) {
                    Some(&d) => {
                        if !edges[i].contains(&d) {
                            edges[i].push(d);
                            reverse_edges[d].push(i);
                        }
                    }
                    None => problems.push(SchemaProblem::new(
                        Some(task.id.to_string()),
                        Some("dependencies"),
                        format!("depends on unknown task '{dep}'"),
                    )),
                }
            }
        }
        if !problems.is_empty() {
            return Err(SchemaError { problems }.into());
        }

        let graph = Self {
            ids: tasks.iter().map(|t| t.id.clone()).collect(),
            index,
            efforts: tasks.iter().map(|t| t.estimated_effort).collect(),
            edges,
            reverse_edges,
        };
        if let Some(cycle_path) = graph.detect_cycle() {
            return Err(CycleError { cycle_path }.into());
        }
        Ok(graph)
    }

    /// First cycle found by a tri-color DFS, or `None` for a DAG.
    fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors = vec![Color::White; self.ids.len()];
        let mut path = Vec::new();
        for start in 0..self.ids.len() {
            if colors[start] == Color::White
                && let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: usize,
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<TaskId>> {
        colors[node] = Color::Gray;
        path.push(node);
        for &dep in &self.edges[node] {
            match colors[dep] {
                Color::Gray => {
                    let from = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<TaskId> =
                        path[from..].iter().map(|&n| self.ids[n].clone()).collect();
                    cycle.push(self.ids[dep].clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        colors[node] = Color::Black;
        path.pop();
        None
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Task ids in definition order.
    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbours(id, &self.edges)
    }

    /// Tasks waiting for `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbours(id, &self.reverse_edges)
    }

    fn neighbours<'a>(&'a self, id: &TaskId, adjacency: &'a [Vec<usize>]) -> Vec<&'a TaskId> {
        self.index
            .get(id)
            .map(|&i| adjacency[i].iter().map(|&n| &self.ids[n]).collect())
            .unwrap_or_default()
    }

    /// Kahn's algorithm. Among nodes that are free at the same time the one
    /// defined first comes first.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut free: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(Reverse(node)) = free.pop() {
            order.push(node);
            for &waiting in &self.reverse_edges[node] {
                in_degree[waiting] -= 1;
                if in_degree[waiting] == 0 {
                    free.push(Reverse(waiting));
                }
            }
        }
        order.into_iter().map(|i| self.ids[i].clone()).collect()
    }

    /// Execution layers: every task sits one layer after its deepest
    /// dependency. Each layer is in definition order.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut waves = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &waiting in &self.reverse_edges[node] {
                    in_degree[waiting] -= 1;
                    if in_degree[waiting] == 0 {
                        next.push(waiting);
                    }
                }
            }
            next.sort_unstable();
            waves.push(current.iter().map(|&i| self.ids[i].clone()).collect());
            current = next;
        }
        waves
    }

    /// Pending tasks whose dependencies are all completed, in definition
    /// order. Tasks missing from `statuses` count as not completed.
    pub fn ready_set(&self, statuses: &HashMap<TaskId, TaskStatus>) -> Vec<TaskId> {
        let completed = |i: usize| statuses.get(&self.ids[i]) == Some(&TaskStatus::Completed);
        (0..self.ids.len())
            .filter(|&i| statuses.get(&self.ids[i]) == Some(&TaskStatus::Pending))
            .filter(|&i| self.edges[i].iter().all(|&d| completed(d)))
            .map(|i| self.ids[i].clone())
            .collect()
    }

    /// Dependencies of `id` that are not completed yet, with their status.
    pub fn blocked_by(
        &self,
        id: &TaskId,
        statuses: &HashMap<TaskId, TaskStatus>,
    ) -> Vec<(TaskId, TaskStatus)> {
        self.dependencies(id)
            .into_iter()
            .filter_map(|dep| {
                let status = statuses.get(dep).copied().unwrap_or(TaskStatus::Pending);
                (status != TaskStatus::Completed).then(|| (dep.clone(), status))
            })
            .collect()
    }
}
