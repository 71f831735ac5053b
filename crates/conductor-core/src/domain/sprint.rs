//! Sprint definition: the human-editable YAML file that holds every task.
//!
//! Parsing is two-phase. The document is first read into loose `Raw*`
//! records where every field is optional, then validated as a whole so that
//! one load reports every problem at once instead of stopping at the first.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CompletionNotes, RoleTag, SchemaError, SchemaProblem, Task, TaskId, TaskStatus};

/// How to launch the worker for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RoleCommandRepr", into = "RoleCommandRepr")]
pub struct RoleCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RoleCommandRepr {
    /// `api: "python workers/api.py --fast"`
    Line(String),
    Full {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

impl From<RoleCommandRepr> for RoleCommand {
    fn from(repr: RoleCommandRepr) -> Self {
        match repr {
            RoleCommandRepr::Line(line) => {
                let mut words = line.split_whitespace().map(str::to_string);
                RoleCommand {
                    program: words.next().unwrap_or_default(),
                    args: words.collect(),
                    env: BTreeMap::new(),
                }
            }
            RoleCommandRepr::Full { command, args, env } => RoleCommand {
                program: command,
                args,
                env,
            },
        }
    }
}

impl From<RoleCommand> for RoleCommandRepr {
    fn from(cmd: RoleCommand) -> Self {
        RoleCommandRepr::Full {
            command: cmd.program,
            args: cmd.args,
            env: cmd.env,
        }
    }
}

impl RoleCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A validated sprint definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SprintDefinition {
    pub name: String,
    /// Raw `settings` block, kept verbatim so a rewrite preserves it.
    pub settings: Option<serde_yaml::Value>,
    pub roles: BTreeMap<RoleTag, RoleCommand>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
struct SprintFileOut<'a> {
    sprint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<&'a serde_yaml::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    roles: &'a BTreeMap<RoleTag, RoleCommand>,
    tasks: &'a [Task],
}

#[derive(Debug, Deserialize)]
struct RawSprint {
    #[serde(default)]
    sprint: Option<String>,
    #[serde(default)]
    settings: Option<serde_yaml::Value>,
    #[serde(default)]
    roles: BTreeMap<RoleTag, RoleCommand>,
    #[serde(default)]
    tasks: Option<Vec<RawTask>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    id: Option<String>,
    name: Option<String>,
    status: Option<String>,
    phase: Option<String>,
    assigned_role: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    estimated_effort: Option<f64>,
    description: Option<String>,
    completed_at: Option<String>,
    completion_notes: Option<CompletionNotes>,
    deferred_reason: Option<String>,
    #[serde(default)]
    revision: u64,
}

impl SprintDefinition {
    /// Parse and validate a sprint definition.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let raw: RawSprint = serde_yaml::from_str(text).map_err(|e| {
            SchemaError::single(SchemaProblem::new(
                None,
                None,
                format!("not a valid sprint document: {e}"),
            ))
        })?;

        let mut problems = Vec::new();
        let name = match raw.sprint {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                problems.push(SchemaProblem::new(None, Some("sprint"), "is required"));
                String::new()
            }
        };
        let raw_tasks = match raw.tasks {
            Some(tasks) => tasks,
            None => {
                problems.push(SchemaProblem::new(None, Some("tasks"), "is required"));
                Vec::new()
            }
        };

        let tasks = match validate_tasks(raw_tasks) {
            Ok(tasks) => tasks,
            Err(mut more) => {
                problems.append(&mut more.problems);
                Vec::new()
            }
        };
        if !problems.is_empty() {
            return Err(SchemaError { problems });
        }

        Ok(Self {
            name,
            settings: raw.settings,
            roles: raw.roles,
            tasks,
        })
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&SprintFileOut {
            sprint: &self.name,
            settings: self.settings.as_ref(),
            roles: &self.roles,
            tasks: &self.tasks,
        })
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

/// Check the set of tasks as a whole: required fields, id format,
/// duplicates, dependency references and status-conditional fields.
fn validate_tasks(raw: Vec<RawTask>) -> Result<Vec<Task>, SchemaError> {
    let mut problems = Vec::new();
    let mut tasks = Vec::with_capacity(raw.len());
    let mut seen = HashSet::new();

    for (index, raw_task) in raw.into_iter().enumerate() {
        let label = raw_task
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("#{index}"));
        if let Some(task) = check_fields(raw_task, &label, &mut problems) {
            if !seen.insert(task.id.clone()) {
                problems.push(SchemaProblem::new(
                    Some(label),
                    Some("id"),
                    "duplicate task id",
                ));
                continue;
            }
            tasks.push(task);
        }
    }

    let statuses: HashMap<&TaskId, TaskStatus> = tasks.iter().map(|t| (&t.id, t.status)).collect();
    for task in &tasks {
        let mut listed = HashSet::new();
        for dep in &task.dependencies {
            let label = Some(task.id.to_string());
            if !listed.insert(dep) {
                problems.push(SchemaProblem::new(
                    label,
                    Some("dependencies"),
                    format!("'{dep}' is listed twice"),
                ));
                continue;
            }
            match statuses.get(dep) {
                None => problems.push(SchemaProblem::new(
                    label,
                    Some("dependencies"),
                    format!("depends on unknown task '{dep}'"),
                )),
                Some(dep_status)
                    if matches!(task.status, TaskStatus::InProgress | TaskStatus::Completed)
                        && *dep_status != TaskStatus::Completed =>
                {
                    problems.push(SchemaProblem::new(
                        label,
                        Some("status"),
                        format!(
                            "is {} but dependency '{dep}' is {dep_status}",
                            task.status
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
    }

    if problems.is_empty() {
        Ok(tasks)
    } else {
        Err(SchemaError { problems })
    }
}

fn required(
    value: Option<String>,
    label: &str,
    field: &str,
    problems: &mut Vec<SchemaProblem>,
) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v),
        _ => {
            problems.push(SchemaProblem::new(
                Some(label.to_string()),
                Some(field),
                "is required",
            ));
            None
        }
    }
}

fn check_fields(raw: RawTask, label: &str, problems: &mut Vec<SchemaProblem>) -> Option<Task> {
    let before = problems.len();
    let push = |problems: &mut Vec<SchemaProblem>, field: &str, message: String| {
        problems.push(SchemaProblem::new(Some(label.to_string()), Some(field), message));
    };

    let id = required(raw.id, label, "id", problems).map(TaskId::new);
    if let Some(id) = &id
        && !id.is_well_formed()
    {
        push(problems, "id", "may only contain letters, digits, '.', '_' and '-'".to_string());
    }
    let name = required(raw.name, label, "name", problems);
    let phase = required(raw.phase, label, "phase", problems);
    let role = required(raw.assigned_role, label, "assignedRole", problems);
    let status = required(raw.status, label, "status", problems).and_then(|s| {
        s.parse::<TaskStatus>()
            .map_err(|e| push(problems, "status", e.to_string()))
            .ok()
    });

    if let Some(effort) = raw.estimated_effort
        && (!effort.is_finite() || effort < 0.0)
    {
        push(problems, "estimatedEffort", format!("must be a non-negative number, got {effort}"));
    }

    let completed_at = raw.completed_at.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| push(problems, "completedAt", format!("not an RFC 3339 timestamp: {e}")))
            .ok()
    });

    let dependencies: Vec<TaskId> = raw.dependencies.into_iter().map(TaskId::new).collect();
    let deferred_reason = raw.deferred_reason.filter(|r| !r.trim().is_empty());

    if let Some(status) = status {
        let completed = status == TaskStatus::Completed;
        if completed {
            if completed_at.is_none() {
                push(problems, "completedAt", "is required when status is completed".to_string());
            }
            match &raw.completion_notes {
                None => push(
                    problems,
                    "completionNotes",
                    "is required when status is completed".to_string(),
                ),
                Some(notes) => {
                    if let Err(notes_problems) = notes.validate() {
                        for p in notes_problems {
                            push(problems, "completionNotes", p.to_string());
                        }
                    }
                }
            }
        } else if completed_at.is_some() || raw.completion_notes.is_some() {
            push(
                problems,
                "status",
                format!("is {status} but completion fields are present"),
            );
        }

        match (status == TaskStatus::Deferred, &deferred_reason) {
            (true, None) => push(
                problems,
                "deferredReason",
                "is required when status is deferred".to_string(),
            ),
            (false, Some(_)) => push(
                problems,
                "deferredReason",
                format!("must be absent when status is {status}"),
            ),
            _ => {}
        }
    }

    if problems.len() != before {
        return None;
    }

    Some(Task {
        id: id?,
        name: name?,
        status: status?,
        phase: phase?,
        assigned_role: RoleTag::new(role?),
        dependencies,
        estimated_effort: raw.estimated_effort,
        description: raw.description,
        completed_at,
        completion_notes: raw.completion_notes,
        deferred_reason,
        revision: raw.revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPRINT: &str = r#"
sprint: auth-revamp
settings:
  maxParallelWorkers: 2
roles:
  database: "python workers/db.py --fast"
  api:
    command: ./workers/api.sh
    args: ["--verbose"]
tasks:
  - id: T1
    name: Schema
    status: completed
    phase: foundation
    assignedRole: database
    estimatedEffort: 2
    completedAt: "2026-03-01T10:00:00Z"
    completionNotes:
      summary: Added users table
      filesChanged: [db/schema.sql]
  - id: T2
    name: Endpoints
    status: pending
    phase: build
    assignedRole: api
    dependencies: [T1]
"#;

    #[test]
    fn parses_full_document() {
        let sprint = SprintDefinition::parse(SPRINT).unwrap();
        assert_eq!(sprint.name, "auth-revamp");
        assert_eq!(sprint.tasks.len(), 2);
        assert_eq!(sprint.tasks[0].status, TaskStatus::Completed);
        assert_eq!(sprint.tasks[1].dependencies, vec![TaskId::new("T1")]);

        let db = &sprint.roles[&RoleTag::new("database")];
        assert_eq!(db.program, "python");
        assert_eq!(db.args, vec!["workers/db.py", "--fast"]);
        let api = &sprint.roles[&RoleTag::new("api")];
        assert_eq!(api.program, "./workers/api.sh");
        assert!(sprint.settings.is_some());
    }

    #[test]
    fn rewrite_preserves_settings_and_roles() {
        let sprint = SprintDefinition::parse(SPRINT).unwrap();
        let again = SprintDefinition::parse(&sprint.to_yaml().unwrap()).unwrap();
        assert_eq!(again, sprint);
    }

    #[test]
    fn reports_every_problem_at_once() {
        let text = r#"
sprint: broken
tasks:
  - id: A
    name: first
    status: pending
    phase: p
  - name: no id
    status: sideways
    phase: p
    assignedRole: api
  - id: "bad/id"
    name: x
    status: pending
    phase: p
    assignedRole: api
    estimatedEffort: -1
"#;
        let err = SprintDefinition::parse(text).unwrap_err();
        let rendered: Vec<String> = err.problems.iter().map(ToString::to_string).collect();
        assert!(rendered.iter().any(|p| p == "task A: assignedRole: is required"));
        assert!(rendered.iter().any(|p| p == "task #1: id: is required"));
        assert!(rendered.iter().any(|p| p.starts_with("task #1: status:")));
        assert!(rendered.iter().any(|p| p.starts_with("task bad/id: id:")));
        assert!(rendered.iter().any(|p| p.starts_with("task bad/id: estimatedEffort:")));
    }

    #[test]
    fn rejects_unknown_and_duplicate_references() {
        let text = r#"
sprint: s
tasks:
  - {id: A, name: a, status: pending, phase: p, assignedRole: r, dependencies: [Z]}
  - {id: A, name: again, status: pending, phase: p, assignedRole: r}
"#;
        let err = SprintDefinition::parse(text).unwrap_err();
        assert!(err.problems.iter().any(|p| p.message == "duplicate task id"));
        assert!(
            err.problems
                .iter()
                .any(|p| p.message == "depends on unknown task 'Z'")
        );
    }

    #[test]
    fn status_conditional_fields_are_enforced() {
        let text = r#"
sprint: s
tasks:
  - {id: A, name: a, status: completed, phase: p, assignedRole: r}
  - {id: B, name: b, status: deferred, phase: p, assignedRole: r}
  - {id: C, name: c, status: pending, phase: p, assignedRole: r, deferredReason: why}
"#;
        let err = SprintDefinition::parse(text).unwrap_err();
        let fields: Vec<(&str, &str)> = err
            .problems
            .iter()
            .map(|p| (p.task.as_deref().unwrap(), p.field.as_deref().unwrap()))
            .collect();
        assert!(fields.contains(&("A", "completedAt")));
        assert!(fields.contains(&("A", "completionNotes")));
        assert!(fields.contains(&("B", "deferredReason")));
        assert!(fields.contains(&("C", "deferredReason")));
    }

    #[test]
    fn started_task_needs_completed_dependencies() {
        let text = r#"
sprint: s
tasks:
  - {id: A, name: a, status: pending, phase: p, assignedRole: r}
  - {id: B, name: b, status: in_progress, phase: p, assignedRole: r, dependencies: [A]}
"#;
        let err = SprintDefinition::parse(text).unwrap_err();
        assert_eq!(err.problems.len(), 1);
        assert_eq!(err.problems[0].field.as_deref(), Some("status"));
    }
}
