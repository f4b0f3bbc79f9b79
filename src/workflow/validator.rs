//! Structural validation of workflow definitions.
//!
//! Unlike a fail-fast check, every violation is collected so an editor can
//! show all problems at once. Validation is pure.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::types::{Handle, NodeType, WorkflowDefinition};

/// A single structural problem in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    EmptyNodeId,
    DuplicateNodeId { node_id: String },
    DuplicateEdgeId { edge_id: String },
    UnknownEdgeSource { edge_id: String, source: String },
    UnknownEdgeTarget { edge_id: String, target: String },
    MissingTrigger,
    MultipleTriggers { node_ids: Vec<String> },
    TriggerHasIncoming { node_id: String, edge_id: String },
    ConditionEdgeCount { node_id: String, count: usize },
    ConditionMissingBranch { node_id: String, handle: Handle },
    ConditionDuplicateBranch { node_id: String, handle: Handle },
    InvalidHandle { edge_id: String, handle: Option<String> },
    UnexpectedHandle { edge_id: String, source: String },
    DelayWithoutOutgoing { node_id: String },
    DelayMultipleOutgoing { node_id: String, count: usize },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::EmptyNodeId => write!(f, "node ID cannot be empty"),
            Violation::DuplicateNodeId { node_id } => write!(f, "duplicate node ID '{}'", node_id),
            Violation::DuplicateEdgeId { edge_id } => write!(f, "duplicate edge ID '{}'", edge_id),
            Violation::UnknownEdgeSource { edge_id, source } => write!(
                f,
                "edge '{}' starts at non-existent node '{}'",
                edge_id, source
            ),
            Violation::UnknownEdgeTarget { edge_id, target } => write!(
                f,
                "edge '{}' points to non-existent node '{}'",
                edge_id, target
            ),
            Violation::MissingTrigger => write!(f, "workflow has no TRIGGER node"),
            Violation::MultipleTriggers { node_ids } => write!(
                f,
                "workflow has {} TRIGGER nodes ({}), expected exactly one",
                node_ids.len(),
                node_ids.join(", ")
            ),
            Violation::TriggerHasIncoming { node_id, edge_id } => write!(
                f,
                "TRIGGER node '{}' has incoming edge '{}'",
                node_id, edge_id
            ),
            Violation::ConditionEdgeCount { node_id, count } => write!(
                f,
                "CONDITION node '{}' has {} outgoing edges, expected exactly 2",
                node_id, count
            ),
            Violation::ConditionMissingBranch { node_id, handle } => write!(
                f,
                "CONDITION node '{}' is missing its '{}' branch",
                node_id, handle
            ),
            Violation::ConditionDuplicateBranch { node_id, handle } => write!(
                f,
                "CONDITION node '{}' has more than one '{}' branch",
                node_id, handle
            ),
            Violation::InvalidHandle { edge_id, handle } => match handle {
                Some(h) => write!(
                    f,
                    "edge '{}' has handle '{}', expected 'true' or 'false'",
                    edge_id, h
                ),
                None => write!(
                    f,
                    "edge '{}' leaves a CONDITION node without a handle",
                    edge_id
                ),
            },
            Violation::UnexpectedHandle { edge_id, source } => write!(
                f,
                "edge '{}' has a handle but its source '{}' is not a CONDITION node",
                edge_id, source
            ),
            Violation::DelayWithoutOutgoing { node_id } => write!(
                f,
                "DELAY node '{}' has no outgoing edge (terminal wait)",
                node_id
            ),
            Violation::DelayMultipleOutgoing { node_id, count } => write!(
                f,
                "DELAY node '{}' has {} outgoing edges, expected one",
                node_id, count
            ),
        }
    }
}

/// All structural violations found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphValidationError {
    pub violations: Vec<Violation>,
}

impl std::fmt::Display for GraphValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Workflow definition has {} violation(s): ",
            self.violations.len()
        )?;
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphValidationError {}

/// Validate a workflow definition.
///
/// Checks:
/// - node IDs are non-empty and unique, edge IDs are unique
/// - every edge endpoint references an existing node
/// - exactly one TRIGGER node, with no incoming edges
/// - every CONDITION node has exactly one `true` and one `false` edge
/// - handles appear only on edges leaving CONDITION nodes
/// - every DELAY node has exactly one outgoing edge
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<(), GraphValidationError> {
    let mut violations = Vec::new();

    let mut types: HashMap<&str, NodeType> = HashMap::new();
    for node in &workflow.nodes {
        if node.id.is_empty() {
            violations.push(Violation::EmptyNodeId);
            continue;
        }
        if types.insert(node.id.as_str(), node.node_type()).is_some() {
            violations.push(Violation::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }

    let mut edge_ids = HashSet::new();
    for edge in &workflow.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            violations.push(Violation::DuplicateEdgeId {
                edge_id: edge.id.clone(),
            });
        }

        let source_type = types.get(edge.source.as_str()).copied();
        if source_type.is_none() {
            violations.push(Violation::UnknownEdgeSource {
                edge_id: edge.id.clone(),
                source: edge.source.clone(),
            });
        }
        if !types.contains_key(edge.target.as_str()) {
            violations.push(Violation::UnknownEdgeTarget {
                edge_id: edge.id.clone(),
                target: edge.target.clone(),
            });
        }

        match source_type {
            Some(NodeType::Condition) => {
                if edge.branch().is_none() {
                    violations.push(Violation::InvalidHandle {
                        edge_id: edge.id.clone(),
                        handle: edge.handle.clone(),
                    });
                }
            }
            Some(_) if edge.handle.is_some() => {
                violations.push(Violation::UnexpectedHandle {
                    edge_id: edge.id.clone(),
                    source: edge.source.clone(),
                });
            }
            _ => {}
        }
    }

    let triggers: Vec<String> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type() == NodeType::Trigger)
        .map(|n| n.id.clone())
        .collect();
    match triggers.len() {
        0 => violations.push(Violation::MissingTrigger),
        1 => {}
        _ => violations.push(Violation::MultipleTriggers {
            node_ids: triggers.clone(),
        }),
    }
    for trigger_id in &triggers {
        for edge in workflow.incoming(trigger_id) {
            violations.push(Violation::TriggerHasIncoming {
                node_id: trigger_id.clone(),
                edge_id: edge.id.clone(),
            });
        }
    }

    for node in &workflow.nodes {
        let outgoing = workflow.outgoing(&node.id);
        match node.node_type() {
            NodeType::Condition => {
                if outgoing.len() != 2 {
                    violations.push(Violation::ConditionEdgeCount {
                        node_id: node.id.clone(),
                        count: outgoing.len(),
                    });
                }
                for handle in [Handle::True, Handle::False] {
                    let count = outgoing
                        .iter()
                        .filter(|e| e.branch() == Some(handle))
                        .count();
                    if count == 0 {
                        violations.push(Violation::ConditionMissingBranch {
                            node_id: node.id.clone(),
                            handle,
                        });
                    } else if count > 1 {
                        violations.push(Violation::ConditionDuplicateBranch {
                            node_id: node.id.clone(),
                            handle,
                        });
                    }
                }
            }
            NodeType::Delay => match outgoing.len() {
                0 => violations.push(Violation::DelayWithoutOutgoing {
                    node_id: node.id.clone(),
                }),
                1 => {}
                count => violations.push(Violation::DelayMultipleOutgoing {
                    node_id: node.id.clone(),
                    count,
                }),
            },
            NodeType::Trigger | NodeType::ActionEmail => {}
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(GraphValidationError { violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    fn definition(body: &str) -> WorkflowDefinition {
        parse_workflow(&format!("id: wf\n{}", body)).unwrap()
    }

    #[test]
    fn test_valid_branching_workflow() {
        let wf = definition(
            r#"
nodes:
  - { id: t, type: TRIGGER, data: { event: lead.created } }
  - { id: c, type: CONDITION, data: { condition: "score > 10" } }
  - { id: hot, type: ACTION_EMAIL, data: { subject: s, body: b } }
  - { id: d, type: DELAY, data: { delayValue: 2, delayType: days } }
  - { id: cold, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: t, target: c }
  - { id: e2, source: c, target: hot, handle: "true" }
  - { id: e3, source: c, target: d, handle: "false" }
  - { id: e4, source: d, target: cold }
"#,
        );
        assert!(validate_workflow(&wf).is_ok());
    }

    #[test]
    fn test_condition_with_only_true_branch() {
        let wf = definition(
            r#"
nodes:
  - { id: t, type: TRIGGER }
  - { id: c, type: CONDITION, data: { condition: "score > 10" } }
  - { id: a, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: t, target: c }
  - { id: e2, source: c, target: a, handle: "true" }
"#,
        );
        let err = validate_workflow(&wf).unwrap_err();
        assert!(err.violations.contains(&Violation::ConditionEdgeCount {
            node_id: "c".into(),
            count: 1
        }));
        assert!(err.violations.contains(&Violation::ConditionMissingBranch {
            node_id: "c".into(),
            handle: Handle::False
        }));
    }

    #[test]
    fn test_condition_with_duplicate_branch() {
        let wf = definition(
            r#"
nodes:
  - { id: t, type: TRIGGER }
  - { id: c, type: CONDITION, data: { condition: "x == 1" } }
  - { id: a, type: ACTION_EMAIL, data: { subject: s, body: b } }
  - { id: b, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: t, target: c }
  - { id: e2, source: c, target: a, handle: "true" }
  - { id: e3, source: c, target: b, handle: "true" }
"#,
        );
        let err = validate_workflow(&wf).unwrap_err();
        assert!(err
            .violations
            .contains(&Violation::ConditionDuplicateBranch {
                node_id: "c".into(),
                handle: Handle::True
            }));
        assert!(err.violations.contains(&Violation::ConditionMissingBranch {
            node_id: "c".into(),
            handle: Handle::False
        }));
    }

    #[test]
    fn test_collects_all_violations() {
        let wf = definition(
            r#"
nodes:
  - { id: d, type: DELAY, data: { delayValue: 1, delayType: days } }
  - { id: a, type: ACTION_EMAIL, data: { subject: s, body: b } }
  - { id: a, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: a, target: ghost, handle: "true" }
"#,
        );
        let err = validate_workflow(&wf).unwrap_err();
        let v = &err.violations;
        assert!(v.contains(&Violation::MissingTrigger));
        assert!(v.contains(&Violation::DuplicateNodeId {
            node_id: "a".into()
        }));
        assert!(v.contains(&Violation::UnknownEdgeTarget {
            edge_id: "e1".into(),
            target: "ghost".into()
        }));
        assert!(v.contains(&Violation::UnexpectedHandle {
            edge_id: "e1".into(),
            source: "a".into()
        }));
        assert!(v.contains(&Violation::DelayWithoutOutgoing {
            node_id: "d".into()
        }));
        assert_eq!(v.len(), 5);
    }

    #[test]
    fn test_trigger_rules() {
        let wf = definition(
            r#"
nodes:
  - { id: t1, type: TRIGGER }
  - { id: t2, type: TRIGGER }
  - { id: a, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: t1, target: a }
  - { id: e2, source: a, target: t1 }
"#,
        );
        let err = validate_workflow(&wf).unwrap_err();
        assert!(err.violations.contains(&Violation::MultipleTriggers {
            node_ids: vec!["t1".into(), "t2".into()]
        }));
        assert!(err.violations.contains(&Violation::TriggerHasIncoming {
            node_id: "t1".into(),
            edge_id: "e2".into()
        }));
    }

    #[test]
    fn test_delay_fan_out_and_bad_handles() {
        let wf = definition(
            r#"
nodes:
  - { id: t, type: TRIGGER }
  - { id: d, type: DELAY, data: { delayValue: 1, delayType: hours } }
  - { id: c, type: CONDITION, data: { condition: "x == 1" } }
  - { id: a, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: t, target: d }
  - { id: e2, source: d, target: c }
  - { id: e3, source: d, target: a }
  - { id: e4, source: c, target: a, handle: "yes" }
  - { id: e5, source: c, target: a }
  - { id: e1, source: ghost, target: a }
"#,
        );
        let err = validate_workflow(&wf).unwrap_err();
        let v = &err.violations;
        assert!(v.contains(&Violation::DelayMultipleOutgoing {
            node_id: "d".into(),
            count: 2
        }));
        assert!(v.contains(&Violation::InvalidHandle {
            edge_id: "e4".into(),
            handle: Some("yes".into())
        }));
        assert!(v.contains(&Violation::InvalidHandle {
            edge_id: "e5".into(),
            handle: None
        }));
        assert!(v.contains(&Violation::DuplicateEdgeId {
            edge_id: "e1".into()
        }));
        assert!(v.contains(&Violation::UnknownEdgeSource {
            edge_id: "e1".into(),
            source: "ghost".into()
        }));
    }

    #[test]
    fn test_error_message_lists_each_violation() {
        let err = GraphValidationError {
            violations: vec![
                Violation::MissingTrigger,
                Violation::DelayWithoutOutgoing {
                    node_id: "wait".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 violation(s)"));
        assert!(msg.contains("no TRIGGER node"));
        assert!(msg.contains("'wait'"));
    }
}
