//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::{NodeType, WorkflowDefinition};

/// Stored workflow record (latest definition).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredWorkflow {
    pub definition: WorkflowDefinition,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredWorkflow {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn is_active(&self) -> bool {
        self.definition.is_active
    }
}

/// Immutable snapshot of one structural version of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    pub workflow_id: String,
    pub version: u32,
    pub definition: WorkflowDefinition,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses are only left through a fresh create-or-restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "WAITING" => Ok(Self::Waiting),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Status of a single history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Running,
    Completed,
    Failed,
}

/// One step of an execution's walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub node_id: String,

    /// Absent when the node could not be resolved in the pinned definition
    #[serde(rename = "type")]
    pub node_type: Option<NodeType>,

    pub status: HistoryStatus,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn completed(node_id: &str, node_type: NodeType, at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type: Some(node_type),
            status: HistoryStatus::Completed,
            timestamp: at,
            error: None,
        }
    }

    pub fn failed(
        node_id: &str,
        node_type: Option<NodeType>,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type,
            status: HistoryStatus::Failed,
            timestamp: at,
            error: Some(error.into()),
        }
    }
}

/// Mutable per-execution data: variables plus the append-only history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// The live execution row for one `(workflowId, leadId)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub workflow_id: String,
    pub lead_id: String,

    /// Identity of the current logical run
    pub run_id: String,

    /// Definition version pinned at creation
    pub workflow_version: u32,

    pub current_node: String,
    pub status: ExecutionStatus,
    pub state: ExecutionData,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_wake_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped on every write
    pub revision: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// A fresh run positioned at the trigger node.
    pub fn new_run(
        workflow: &WorkflowDefinition,
        trigger_node: &str,
        lead_id: &str,
        variables: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            lead_id: lead_id.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_version: workflow.version,
            current_node: trigger_node.to_string(),
            status: ExecutionStatus::Pending,
            state: ExecutionData {
                variables,
                history: Vec::new(),
            },
            next_wake_at: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.state.history
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.state.variables
    }
}

/// Archived run, written when a `(workflowId, leadId)` pair is restarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub run_id: String,
    pub workflow_id: String,
    pub lead_id: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub current_node: String,
    pub state: ExecutionData,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

/// Minimal lead record used to seed manual triggers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Lead {
    /// Seed variables for an execution of this lead.
    pub fn variables(&self) -> Map<String, Value> {
        let mut vars = self.attributes.clone();
        vars.insert("leadId".into(), Value::String(self.id.clone()));
        if let Some(email) = &self.email {
            vars.insert("email".into(), Value::String(email.clone()));
        }
        if let Some(name) = &self.name {
            vars.insert("name".into(), Value::String(name.clone()));
        }
        vars
    }
}

/// Durable timer for a suspended execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledWakeup {
    pub id: String,
    pub workflow_id: String,
    pub lead_id: String,
    pub run_id: String,
    pub wake_at: DateTime<Utc>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
