//! Workflow definition parser (YAML or JSON).

use std::path::Path;

use super::types::WorkflowDefinition;
use crate::error::{Error, Result};

/// Parse a workflow definition from a YAML or JSON string.
///
/// JSON is a subset of YAML, so both go through the YAML deserializer.
pub fn parse_workflow(source: &str) -> Result<WorkflowDefinition> {
    if source.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let workflow: WorkflowDefinition = serde_yaml::from_str(source).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid workflow definition: {}", msg))
        }
    })?;
    Ok(workflow)
}

/// Parse a workflow definition from a file path.
pub fn parse_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodeKind, NodeType};

    #[test]
    fn test_parse_yaml_definition() {
        let yaml = r#"
id: nurture
name: Nurture campaign
nodes:
  - id: start
    type: TRIGGER
    data:
      event: lead.created
      filters:
        source: webinar
  - id: wait
    type: DELAY
    data: { delayValue: 1, delayType: days }
  - id: check
    type: CONDITION
    data: { condition: "score >", value: 10 }
  - id: hot
    type: ACTION_EMAIL
    data: { subject: "Hi {{name}}", body: "Let's talk" }
edges:
  - { id: e1, source: start, target: wait }
  - { id: e2, source: wait, target: check }
  - { id: e3, source: check, target: hot, handle: "true" }
"#;

        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(workflow.id, "nurture");
        assert!(workflow.is_active);
        assert_eq!(workflow.version, 1);
        assert_eq!(workflow.nodes.len(), 4);
        assert_eq!(workflow.edges[2].handle.as_deref(), Some("true"));

        match &workflow.get_node("start").unwrap().kind {
            NodeKind::Trigger(t) => {
                assert_eq!(t.event.as_deref(), Some("lead.created"));
                assert_eq!(t.filters["source"], "webinar");
            }
            other => panic!("expected trigger, got {:?}", other),
        }
        assert_eq!(
            workflow.get_node("check").unwrap().node_type(),
            NodeType::Condition
        );
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{
            "id": "wf-json",
            "isActive": false,
            "nodes": [{"id": "t", "type": "TRIGGER", "data": {}}],
            "edges": []
        }"#;
        let workflow = parse_workflow(json).unwrap();
        assert!(!workflow.is_active);
        assert_eq!(workflow.trigger_node().unwrap().id, "t");
    }

    #[test]
    fn test_parse_empty_definition() {
        let err = parse_workflow("  ").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("empty workflow"));
    }

    #[test]
    fn test_parse_missing_nodes() {
        let err = parse_workflow("id: lonely\n").unwrap_err();
        assert!(err.to_string().contains("Missing required field: nodes"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_workflow("id: [broken").unwrap_err();
        assert!(err.to_string().contains("Invalid workflow definition"));
    }
}
