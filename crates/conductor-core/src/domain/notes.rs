//! Completion notes: the structured rationale a task must carry before it
//! may be marked completed.

use serde::{Deserialize, Serialize};

/// Ready-to-fill template returned whenever notes are missing or malformed.
pub const COMPLETION_NOTES_TEMPLATE: &str = "\
summary: <what was delivered, in one or two sentences>
filesChanged:
  - <path/of/changed/file>
designDecisions:
  - <decision taken and the alternative that was rejected>
nextTasks:
  - <follow-up task id or short description>
testing: <how the change was verified>
";

/// Structured completion notes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotes {
    #[serde(default)]
    pub summary: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub design_decisions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_tasks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing: Option<String>,
}

/// Why a set of notes was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotesProblem {
    /// Nothing was supplied.
    Missing,
    /// Text could not be read as a notes mapping.
    Unparseable(String),
    /// A field is blank or still holds a template placeholder.
    Field { field: &'static str, message: String },
}

impl std::fmt::Display for NotesProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotesProblem::Missing => f.write_str("completion notes are missing"),
            NotesProblem::Unparseable(e) => write!(f, "completion notes are not structured: {e}"),
            NotesProblem::Field { field, message } => write!(f, "{field}: {message}"),
        }
    }
}

impl CompletionNotes {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.files_changed.push(path.into());
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.design_decisions.push(decision.into());
        self
    }

    pub fn with_next_task(mut self, next: impl Into<String>) -> Self {
        self.next_tasks.push(next.into());
        self
    }

    /// Parse notes from user text.
    ///
    /// The text must be a YAML (or JSON) mapping shaped like
    /// [`COMPLETION_NOTES_TEMPLATE`]. The result is validated before it is
    /// returned.
    pub fn parse(text: &str) -> Result<Self, Vec<NotesProblem>> {
        if text.trim().is_empty() {
            return Err(vec![NotesProblem::Missing]);
        }
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| vec![NotesProblem::Unparseable(e.to_string())])?;
        if !value.is_mapping() {
            return Err(vec![NotesProblem::Unparseable(
                "expected a mapping with at least a `summary` field".to_string(),
            )]);
        }
        let notes: CompletionNotes = serde_yaml::from_value(value)
            .map_err(|e| vec![NotesProblem::Unparseable(e.to_string())])?;
        notes.validate()?;
        Ok(notes)
    }

    /// Check that the notes are well formed.
    ///
    /// Every problem is collected so a caller can fix them in one pass.
    pub fn validate(&self) -> Result<(), Vec<NotesProblem>> {
        let mut problems = Vec::new();

        if self.summary.trim().is_empty() {
            problems.push(NotesProblem::Field {
                field: "summary",
                message: "must not be empty".to_string(),
            });
        } else if is_placeholder(&self.summary) {
            problems.push(NotesProblem::Field {
                field: "summary",
                message: "still contains the template placeholder".to_string(),
            });
        }

        let lists: [(&'static str, &Vec<String>); 3] = [
            ("filesChanged", &self.files_changed),
            ("designDecisions", &self.design_decisions),
            ("nextTasks", &self.next_tasks),
        ];
        for (field, items) in lists {
            if items.iter().any(|item| item.trim().is_empty()) {
                problems.push(NotesProblem::Field {
                    field,
                    message: "contains a blank entry".to_string(),
                });
            }
            if items.iter().any(|item| is_placeholder(item)) {
                problems.push(NotesProblem::Field {
                    field,
                    message: "still contains a template placeholder".to_string(),
                });
            }
        }

        if let Some(testing) = &self.testing
            && is_placeholder(testing)
        {
            problems.push(NotesProblem::Field {
                field: "testing",
                message: "still contains the template placeholder".to_string(),
            });
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

fn is_placeholder(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('<') && t.ends_with('>')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_missing() {
        assert_eq!(CompletionNotes::parse("  \n"), Err(vec![NotesProblem::Missing]));
    }

    #[test]
    fn plain_sentence_is_not_structured() {
        let err = CompletionNotes::parse("did the thing").unwrap_err();
        assert!(matches!(err[0], NotesProblem::Unparseable(_)));
    }

    #[test]
    fn unfilled_template_is_rejected() {
        let err = CompletionNotes::parse(COMPLETION_NOTES_TEMPLATE).unwrap_err();
        let fields: Vec<_> = err
            .iter()
            .filter_map(|p| match p {
                NotesProblem::Field { field, .. } => Some(*field),
                _ => None,
            })
            .collect();
        assert!(fields.contains(&"summary"));
        assert!(fields.contains(&"filesChanged"));
        assert!(fields.contains(&"testing"));
    }

    #[test]
    fn filled_notes_parse() {
        let text = "summary: Added the users table\nfilesChanged:\n  - db/schema.sql\n";
        let notes = CompletionNotes::parse(text).unwrap();
        assert_eq!(notes.summary, "Added the users table");
        assert_eq!(notes.files_changed, vec!["db/schema.sql".to_string()]);
    }

    #[test]
    fn json_notes_parse() {
        let notes = CompletionNotes::parse(r#"{"summary": "ok", "nextTasks": ["T9"]}"#).unwrap();
        assert_eq!(notes.next_tasks, vec!["T9".to_string()]);
    }

    #[test]
    fn missing_summary_is_reported() {
        let err = CompletionNotes::parse("filesChanged: [a.rs]").unwrap_err();
        assert_eq!(
            err,
            vec![NotesProblem::Field {
                field: "summary",
                message: "must not be empty".to_string()
            }]
        );
    }
}
