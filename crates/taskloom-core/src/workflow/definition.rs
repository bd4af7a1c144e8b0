//! Workflow definition parsing and structural validation.
//!
//! Converts YAML (or JSON) documents into the canonical `WorkflowDefinition`
//! and checks the constraints that serde cannot express before handing the
//! definition to the graph resolver.

use taskloom_types::error::GraphError;
use taskloom_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::graph::DependencyGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Field-level validation failure.
    #[error("validation error: {0}")]
    Invalid(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML (or JSON) document into a `WorkflowDefinition`.
///
/// Only deserializes. Call [`validate_definition`] before submitting.
pub fn parse_definition(source: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml_ng::from_str(source).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition and return its resolved graph.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<DependencyGraph, DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::Invalid("workflow name is empty".to_string()));
    }

    for (task_id, task) in &def.tasks {
        if task_id.trim().is_empty() {
            return Err(DefinitionError::Invalid("task id is empty".to_string()));
        }
        if task.action.trim().is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "task '{task_id}' has no action"
            )));
        }
        if task.timeout_secs == Some(0) {
            return Err(DefinitionError::Invalid(format!(
                "task '{task_id}' has a zero timeout"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &task.depends_on {
            if !seen.insert(dep.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "task '{task_id}' lists dependency '{dep}' more than once"
                )));
            }
        }
    }

    if def.config.timeout_secs == Some(0) {
        return Err(DefinitionError::Invalid(
            "workflow timeout_secs must be at least 1".to_string(),
        ));
    }

    if def.config.max_concurrency == Some(0) {
        return Err(DefinitionError::Invalid(
            "max_concurrency must be at least 1".to_string(),
        ));
    }

    Ok(DependencyGraph::resolve(def)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name: etl
tasks:
  extract:
    action: http
  transform:
    action: echo
    depends_on: [extract]
  load:
    action: echo
    depends_on: [transform]
"#;

    #[test]
    fn test_parse_and_validate() {
        let def = parse_definition(VALID).unwrap();
        let graph = validate_definition(&def).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.level_widths(), vec![1, 1, 1]);
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{"name": "j", "tasks": {"a": {"action": "echo"}}}"#;
        let def = parse_definition(json).unwrap();
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_parse_error() {
        let err = parse_definition("name: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_missing_action_rejected() {
        let def = parse_definition("name: x\ntasks:\n  a:\n    action: ''\n").unwrap();
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("has no action"));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let task_level = "name: x\ntasks:\n  a:\n    action: echo\n    timeout_secs: 0\n";
        let err = validate_definition(&parse_definition(task_level).unwrap()).unwrap_err();
        assert!(err.to_string().contains("zero timeout"));

        let workflow_level = "name: x\ntasks:\n  a:\n    action: echo\nconfig:\n  timeout_secs: 0\n";
        let err = validate_definition(&parse_definition(workflow_level).unwrap()).unwrap_err();
        assert!(matches!(err, DefinitionError::Invalid(ref m) if m.contains("timeout_secs")));

        let fine = "name: x\ntasks:\n  a:\n    action: echo\nconfig:\n  timeout_secs: 5\n";
        assert!(validate_definition(&parse_definition(fine).unwrap()).is_ok());
    }

    #[test]
    fn test_duplicate_dependency_rejected() {
        let yaml = "name: x\ntasks:\n  a:\n    action: echo\n  b:\n    action: echo\n    depends_on: [a, a]\n";
        let err = validate_definition(&parse_definition(yaml).unwrap()).unwrap_err();
        assert!(matches!(err, DefinitionError::Invalid(_)));
    }

    #[test]
    fn test_graph_errors_pass_through() {
        let yaml = "name: x\ntasks:\n  a:\n    action: echo\n    depends_on: [b]\n  b:\n    action: echo\n    depends_on: [a]\n";
        let err = validate_definition(&parse_definition(yaml).unwrap()).unwrap_err();
        assert!(matches!(err, DefinitionError::Graph(GraphError::CycleDetected(_))));

        let empty = parse_definition("name: x\ntasks: {}\n").unwrap();
        assert!(matches!(
            validate_definition(&empty).unwrap_err(),
            DefinitionError::Graph(GraphError::EmptyGraph)
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let def = parse_definition(VALID).unwrap();
        let yaml = serialize_definition(&def).unwrap();
        let back = parse_definition(&yaml).unwrap();
        assert!(def.same_body(&back));
    }
}
