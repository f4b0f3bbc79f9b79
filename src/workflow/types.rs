//! Workflow definition types.
//!
//! A definition is a directed graph of typed nodes. The wire form of a node is
//! `{ id, type, data }`; it is parsed into the closed [`NodeKind`] sum type so
//! every executor dispatch is an exhaustive match.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// id: welcome-sequence
/// name: Welcome sequence
/// isActive: true
/// nodes:
///   - id: start
///     type: TRIGGER
///     data: { event: lead.created }
///   - id: hello
///     type: ACTION_EMAIL
///     data: { subject: "Hi {{name}}", body: "Welcome aboard" }
/// edges:
///   - { id: e1, source: start, target: hello }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Stable workflow identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Nodes (steps) of the graph
    pub nodes: Vec<Node>,

    /// Directed edges between nodes
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Whether new executions may start
    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Structural version, assigned by the store
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_active() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// Incoming edges of a node, in declaration order.
    pub fn incoming(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    /// The entry point of the graph (first TRIGGER node).
    pub fn trigger_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.node_type() == NodeType::Trigger)
    }
}

/// Node type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Trigger,
    ActionEmail,
    Delay,
    Condition,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "TRIGGER",
            NodeType::ActionEmail => "ACTION_EMAIL",
            NodeType::Delay => "DELAY",
            NodeType::Condition => "CONDITION",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node (step) in the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    /// Unique node ID within this workflow
    pub id: String,
    /// Typed payload
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Trigger(_) => NodeType::Trigger,
            NodeKind::ActionEmail(_) => NodeType::ActionEmail,
            NodeKind::Delay(_) => NodeType::Delay,
            NodeKind::Condition(_) => NodeType::Condition,
        }
    }
}

/// Type-specific node payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger(TriggerData),
    ActionEmail(EmailData),
    Delay(DelayData),
    Condition(ConditionData),
}

/// Wire form of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        // Nodes without a payload are allowed; type-specific checks happen later.
        let data = if raw.data.is_null() {
            Value::Object(Map::new())
        } else {
            raw.data
        };
        let invalid = |e: serde_json::Error| {
            format!("invalid data for {} node '{}': {}", raw.node_type, raw.id, e)
        };

        let kind = match raw.node_type {
            NodeType::Trigger => NodeKind::Trigger(serde_json::from_value(data).map_err(invalid)?),
            NodeType::ActionEmail => {
                NodeKind::ActionEmail(serde_json::from_value(data).map_err(invalid)?)
            }
            NodeType::Delay => NodeKind::Delay(serde_json::from_value(data).map_err(invalid)?),
            NodeType::Condition => {
                NodeKind::Condition(serde_json::from_value(data).map_err(invalid)?)
            }
        };

        Ok(Node { id: raw.id, kind })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let node_type = node.node_type();
        let data = match node.kind {
            NodeKind::Trigger(d) => serde_json::to_value(d),
            NodeKind::ActionEmail(d) => serde_json::to_value(d),
            NodeKind::Delay(d) => serde_json::to_value(d),
            NodeKind::Condition(d) => serde_json::to_value(d),
        }
        .unwrap_or(Value::Null);

        RawNode {
            id: node.id,
            node_type,
            data,
        }
    }
}

/// TRIGGER payload: which external events start an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    /// Event type to match (e.g. `lead.created`). Manual-only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Field filters: dotted payload path -> expected value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// ACTION_EMAIL payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailData {
    pub subject: String,

    /// Body template with `{{variable}}` placeholders
    pub body: String,

    /// Recipient template; defaults to the `email` variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Sender override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Reference to a stored template (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// DELAY payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayData {
    pub delay_value: f64,

    /// seconds | minutes | hours | days
    pub delay_type: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// CONDITION payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionData {
    /// `"<variable> <op>"` or `"<variable> <op> <literal>"`
    pub condition: String,

    /// Comparison value when the expression carries no literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,

    /// Branch selector, required on CONDITION sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle.as_str().to_string());
        self
    }

    /// The parsed branch handle, if any.
    pub fn branch(&self) -> Option<Handle> {
        self.handle.as_deref().and_then(Handle::parse)
    }
}

/// Outgoing-edge selector used by CONDITION nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handle {
    True,
    False,
}

impl Handle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handle::True => "true",
            Handle::False => "false",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "true" => Some(Handle::True),
            "false" => Some(Handle::False),
            _ => None,
        }
    }
}

impl From<bool> for Handle {
    fn from(b: bool) -> Self {
        if b {
            Handle::True
        } else {
            Handle::False
        }
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_wire_form_round_trips_unknown_fields() {
        let raw = json!({
            "id": "wait",
            "type": "DELAY",
            "data": { "delayValue": 3, "delayType": "days", "label": "Wait 3 days" }
        });
        let node: Node = serde_json::from_value(raw).unwrap();
        match &node.kind {
            NodeKind::Delay(d) => {
                assert_eq!(d.delay_value, 3.0);
                assert_eq!(d.delay_type, "days");
                assert_eq!(d.extra["label"], "Wait 3 days");
            }
            other => panic!("expected delay node, got {:?}", other),
        }

        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["type"], "DELAY");
        assert_eq!(back["data"]["label"], "Wait 3 days");
    }

    #[test]
    fn test_node_with_bad_data_is_rejected() {
        let raw = json!({ "id": "mail", "type": "ACTION_EMAIL", "data": { "subject": 5 } });
        let err = serde_json::from_value::<Node>(raw).unwrap_err();
        assert!(err.to_string().contains("mail"));
    }

    #[test]
    fn test_unknown_node_type_is_rejected() {
        let raw = json!({ "id": "x", "type": "WEBHOOK", "data": {} });
        assert!(serde_json::from_value::<Node>(raw).is_err());
    }

    #[test]
    fn test_trigger_without_data() {
        let raw = json!({ "id": "t", "type": "TRIGGER" });
        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.node_type(), NodeType::Trigger);
    }

    #[test]
    fn test_edge_branch_parsing() {
        let edge = Edge::new("e1", "c", "a").with_handle(Handle::False);
        assert_eq!(edge.branch(), Some(Handle::False));

        let odd = Edge {
            handle: Some("maybe".into()),
            ..Edge::new("e2", "c", "b")
        };
        assert_eq!(odd.branch(), None);
    }
}
