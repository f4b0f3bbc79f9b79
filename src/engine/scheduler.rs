//! Execution scheduler: the per-(workflow, lead) state machine.
//!
//! States: PENDING -> RUNNING -> {WAITING <-> RUNNING}* -> {COMPLETED | FAILED | CANCELLED}.
//!
//! Each transition is one optimistic write guarded by the revision read at
//! the start of that transition. A lost write abandons the step and returns
//! whatever the winning writer stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::nodes::{execute_node, EmailSender, NodeContext, Outcome};
use crate::storage::{ExecutionState, ExecutionStatus, HistoryEntry, SqliteStorage};
use crate::workflow::{Edge, Handle, Node, NodeType, WorkflowDefinition};

/// Default node evaluations per invocation.
pub const DEFAULT_MAX_STEPS: u32 = 100;

/// Result of an optimistic write.
enum Commit {
    Written(ExecutionState),
    /// Another writer won; carries the state it stored.
    Lost(ExecutionState),
}

/// Drives executions through their workflow graph.
#[derive(Clone)]
pub struct Scheduler {
    storage: SqliteStorage,
    email: Arc<dyn EmailSender>,
    max_steps: u32,
}

impl Scheduler {
    pub fn new(storage: SqliteStorage, email: Arc<dyn EmailSender>) -> Self {
        Self {
            storage,
            email,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Bound the synchronous advance loop of a single invocation.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Create-or-restart the execution for `(workflow, lead)` and begin walking.
    pub async fn start_run(
        &self,
        workflow: &WorkflowDefinition,
        lead_id: &str,
        variables: Map<String, Value>,
        source: &str,
    ) -> Result<ExecutionState> {
        self.start_run_at(workflow, lead_id, variables, source, Utc::now())
            .await
    }

    #[instrument(
        name = "execution.start",
        skip(self, workflow, variables, now),
        fields(workflow_id = %workflow.id, version = workflow.version)
    )]
    pub async fn start_run_at(
        &self,
        workflow: &WorkflowDefinition,
        lead_id: &str,
        variables: Map<String, Value>,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionState> {
        let trigger = workflow.trigger_node().ok_or_else(|| {
            Error::GraphIntegrity(format!("workflow '{}' has no TRIGGER node", workflow.id))
        })?;

        let mut fresh = ExecutionState::new_run(workflow, &trigger.id, lead_id, variables, now);
        fresh.status = ExecutionStatus::Running;
        let created = self.storage.start_run(&fresh).await?;

        metrics::record_execution_started(source);
        info!(
            run_id = %created.run_id,
            "Started execution of workflow '{}' for lead '{}'",
            workflow.id, lead_id
        );

        self.advance(created, now).await
    }

    /// Step the execution from its current node.
    pub async fn step(&self, workflow_id: &str, lead_id: &str) -> Result<ExecutionState> {
        self.step_at(workflow_id, lead_id, Utc::now()).await
    }

    /// Step with an explicit notion of "now".
    ///
    /// Terminal and WAITING executions are returned unchanged: only
    /// [`Scheduler::resume_at`] may leave WAITING.
    #[instrument(name = "execution.step", skip(self, now))]
    pub async fn step_at(
        &self,
        workflow_id: &str,
        lead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionState> {
        let state = self.load(workflow_id, lead_id).await?;
        self.advance(state, now).await
    }

    /// Wake a WAITING execution.
    pub async fn resume(
        &self,
        workflow_id: &str,
        lead_id: &str,
        run_id: Option<&str>,
    ) -> Result<ExecutionState> {
        self.resume_at(workflow_id, lead_id, run_id, Utc::now())
            .await
    }

    /// Wake a WAITING execution whose delay has elapsed.
    ///
    /// A no-op unless the execution is WAITING, `now` is at or past
    /// `nextWakeAt`, and `run_id` (when given) names the current run.
    /// Safe to call repeatedly for the same wake-up.
    #[instrument(name = "execution.resume", skip(self, now))]
    pub async fn resume_at(
        &self,
        workflow_id: &str,
        lead_id: &str,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionState> {
        let state = self.load(workflow_id, lead_id).await?;

        if state.status != ExecutionStatus::Waiting {
            debug!(status = %state.status, "Ignoring wake-up for execution that is not waiting");
            return Ok(state);
        }
        if run_id.is_some_and(|id| id != state.run_id) {
            debug!("Ignoring wake-up for a superseded run");
            return Ok(state);
        }
        if let Some(wake_at) = state.next_wake_at {
            if now < wake_at {
                debug!(%wake_at, "Ignoring early wake-up");
                return Ok(state);
            }
        }

        let definition = match self.pinned_definition(&state).await? {
            Some(def) => def,
            None => {
                let reason = self.missing_version_reason(&state);
                return self.fail(state, None, reason, now, "resume").await;
            }
        };

        let delay = match definition.get_node(&state.current_node) {
            Some(node) if node.node_type() == NodeType::Delay => node,
            Some(node) => {
                let reason = format!(
                    "waiting on node '{}' which is a {} node, not DELAY",
                    node.id,
                    node.node_type()
                );
                let node_type = Some(node.node_type());
                return self.fail(state, node_type, reason, now, "resume").await;
            }
            None => {
                let reason = format!(
                    "node '{}' not found in version {} of workflow '{}'",
                    state.current_node, state.workflow_version, state.workflow_id
                );
                return self.fail(state, None, reason, now, "resume").await;
            }
        };

        info!("Resuming execution after delay node '{}'", delay.id);

        let expected = state.revision;
        let mut next = state.clone();
        next.next_wake_at = None;
        next.updated_at = now;
        push_history(&mut next, HistoryEntry::completed(&delay.id, NodeType::Delay, now));

        match select_edge(&definition, delay, None) {
            None => {
                next.status = ExecutionStatus::Completed;
                match self.commit(next, expected, "resume").await? {
                    Commit::Written(done) => {
                        metrics::record_execution_finished(done.status.as_str());
                        Ok(done)
                    }
                    Commit::Lost(current) => Ok(current),
                }
            }
            Some(edge) => {
                if definition.get_node(&edge.target).is_none() {
                    let reason = dangling_edge_reason(edge);
                    return self
                        .fail(state, Some(NodeType::Delay), reason, now, "resume")
                        .await;
                }
                next.status = ExecutionStatus::Running;
                next.current_node = edge.target.clone();
                match self.commit(next, expected, "resume").await? {
                    Commit::Written(running) => self.walk(running, &definition, now).await,
                    Commit::Lost(current) => Ok(current),
                }
            }
        }
    }

    /// Cancel a non-terminal execution. Terminal executions are returned unchanged.
    ///
    /// A wake-up that fires later finds the execution CANCELLED and does nothing.
    #[instrument(name = "execution.cancel", skip(self))]
    pub async fn cancel(&self, workflow_id: &str, lead_id: &str) -> Result<ExecutionState> {
        const MAX_ATTEMPTS: usize = 3;

        let mut state = self.load(workflow_id, lead_id).await?;
        for _ in 0..MAX_ATTEMPTS {
            if state.status.is_terminal() {
                return Ok(state);
            }

            let expected = state.revision;
            let mut next = state.clone();
            next.status = ExecutionStatus::Cancelled;
            next.next_wake_at = None;
            next.updated_at = Utc::now();

            match self.commit(next, expected, "cancel").await? {
                Commit::Written(cancelled) => {
                    metrics::record_execution_finished(cancelled.status.as_str());
                    info!("Execution cancelled");
                    return Ok(cancelled);
                }
                Commit::Lost(current) => state = current,
            }
        }
        Ok(state)
    }

    async fn load(&self, workflow_id: &str, lead_id: &str) -> Result<ExecutionState> {
        self.storage
            .get_execution(workflow_id, lead_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "execution for workflow '{}' and lead '{}'",
                    workflow_id, lead_id
                ))
            })
    }

    async fn pinned_definition(&self, state: &ExecutionState) -> Result<Option<WorkflowDefinition>> {
        Ok(self
            .storage
            .get_workflow_version(&state.workflow_id, state.workflow_version)
            .await?
            .map(|v| v.definition))
    }

    fn missing_version_reason(&self, state: &ExecutionState) -> String {
        format!(
            "pinned version {} of workflow '{}' not found",
            state.workflow_version, state.workflow_id
        )
    }

    /// Entry from `step`/`start_run`: guard the status, then walk.
    async fn advance(&self, state: ExecutionState, now: DateTime<Utc>) -> Result<ExecutionState> {
        let state = match state.status {
            ExecutionStatus::Completed
            | ExecutionStatus::Failed
            | ExecutionStatus::Cancelled
            | ExecutionStatus::Waiting => {
                debug!(status = %state.status, "Nothing to step");
                return Ok(state);
            }
            ExecutionStatus::Pending => {
                let expected = state.revision;
                let mut next = state;
                next.status = ExecutionStatus::Running;
                next.updated_at = now;
                match self.commit(next, expected, "step").await? {
                    Commit::Written(running) => running,
                    Commit::Lost(current) => return Ok(current),
                }
            }
            ExecutionStatus::Running => state,
        };

        let definition = match self.pinned_definition(&state).await? {
            Some(def) => def,
            None => {
                let reason = self.missing_version_reason(&state);
                return self.fail(state, None, reason, now, "step").await;
            }
        };

        self.walk(state, &definition, now).await
    }

    /// Evaluate nodes until the execution suspends, terminates, or the budget runs out.
    async fn walk(
        &self,
        mut state: ExecutionState,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Result<ExecutionState> {
        let mut steps = 0u32;

        loop {
            let node = match definition.get_node(&state.current_node) {
                Some(node) => node,
                None => {
                    let reason = format!(
                        "node '{}' not found in version {} of workflow '{}'",
                        state.current_node, state.workflow_version, state.workflow_id
                    );
                    return self.fail(state, None, reason, now, "step").await;
                }
            };

            if steps >= self.max_steps {
                warn!(
                    node_id = %node.id,
                    max_steps = self.max_steps,
                    "Step budget exhausted"
                );
                let reason = format!(
                    "step budget of {} exhausted at node '{}', possible cycle",
                    self.max_steps, node.id
                );
                return self
                    .fail(state, Some(node.node_type()), reason, now, "step")
                    .await;
            }
            steps += 1;

            let mut ctx = NodeContext::new(&state.workflow_id, &state.lead_id, now)
                .with_variables(state.state.variables.clone());
            let outcome = execute_node(node, &mut ctx, self.email.as_ref()).await;
            metrics::record_node_execution(node.node_type().as_str(), outcome.label());
            debug!(node_id = %node.id, outcome = outcome.label(), "Node evaluated");

            let expected = state.revision;
            let mut next = state.clone();
            next.state.variables = ctx.variables;
            next.updated_at = now;

            match outcome {
                Outcome::Advance(handle) => match select_edge(definition, node, handle) {
                    None => {
                        next.status = ExecutionStatus::Completed;
                        push_history(
                            &mut next,
                            HistoryEntry::completed(&node.id, node.node_type(), now),
                        );
                        return match self.commit(next, expected, "step").await? {
                            Commit::Written(done) => {
                                metrics::record_execution_finished(done.status.as_str());
                                info!(node_id = %node.id, "Execution completed");
                                Ok(done)
                            }
                            Commit::Lost(current) => Ok(current),
                        };
                    }
                    Some(edge) if definition.get_node(&edge.target).is_none() => {
                        let reason = dangling_edge_reason(edge);
                        return self
                            .fail(state, Some(node.node_type()), reason, now, "step")
                            .await;
                    }
                    Some(edge) => {
                        next.current_node = edge.target.clone();
                        push_history(
                            &mut next,
                            HistoryEntry::completed(&node.id, node.node_type(), now),
                        );
                        match self.commit(next, expected, "step").await? {
                            Commit::Written(advanced) => state = advanced,
                            Commit::Lost(current) => return Ok(current),
                        }
                    }
                },
                Outcome::Suspend(wake_at) => {
                    next.status = ExecutionStatus::Waiting;
                    next.next_wake_at = Some(wake_at);
                    return match self.commit(next, expected, "step").await? {
                        Commit::Written(waiting) => {
                            info!(node_id = %node.id, %wake_at, "Execution waiting");
                            Ok(waiting)
                        }
                        Commit::Lost(current) => Ok(current),
                    };
                }
                Outcome::Fail(reason) => {
                    let error = Error::NodeExecution {
                        node_id: node.id.clone(),
                        message: reason,
                    };
                    warn!(node_id = %node.id, error = %error, "Node failed");
                    next.status = ExecutionStatus::Failed;
                    push_history(
                        &mut next,
                        HistoryEntry::failed(&node.id, Some(node.node_type()), now, error.to_string()),
                    );
                    return match self.commit(next, expected, "step").await? {
                        Commit::Written(failed) => {
                            metrics::record_execution_finished(failed.status.as_str());
                            Ok(failed)
                        }
                        Commit::Lost(current) => Ok(current),
                    };
                }
            }
        }
    }

    /// Terminate with a graph integrity error recorded against the current node.
    async fn fail(
        &self,
        state: ExecutionState,
        node_type: Option<NodeType>,
        reason: String,
        now: DateTime<Utc>,
        operation: &'static str,
    ) -> Result<ExecutionState> {
        let error = Error::GraphIntegrity(reason);
        warn!(
            workflow_id = %state.workflow_id,
            lead_id = %state.lead_id,
            error = %error,
            "Execution failed"
        );

        let expected = state.revision;
        let mut next = state;
        next.status = ExecutionStatus::Failed;
        next.next_wake_at = None;
        next.updated_at = now;
        let node_id = next.current_node.clone();
        push_history(
            &mut next,
            HistoryEntry::failed(&node_id, node_type, now, error.to_string()),
        );

        match self.commit(next, expected, operation).await? {
            Commit::Written(failed) => {
                metrics::record_execution_finished(failed.status.as_str());
                Ok(failed)
            }
            Commit::Lost(current) => Ok(current),
        }
    }

    async fn commit(
        &self,
        next: ExecutionState,
        expected_revision: i64,
        operation: &'static str,
    ) -> Result<Commit> {
        match self.storage.update_execution(&next, expected_revision).await {
            Ok(written) => Ok(Commit::Written(written)),
            Err(Error::ConcurrentUpdate {
                workflow_id,
                lead_id,
            }) => {
                debug!(
                    %workflow_id,
                    %lead_id,
                    operation,
                    expected_revision,
                    "Lost optimistic write, abandoning step"
                );
                metrics::record_concurrent_update(operation);
                let current = self.load(&workflow_id, &lead_id).await?;
                Ok(Commit::Lost(current))
            }
            Err(e) => Err(e),
        }
    }
}

/// Pick the outgoing edge for an advance.
///
/// CONDITION nodes follow the edge carrying the chosen handle; other nodes
/// follow their first declared edge. `None` means the node is terminal.
fn select_edge<'a>(
    definition: &'a WorkflowDefinition,
    node: &Node,
    handle: Option<Handle>,
) -> Option<&'a Edge> {
    let outgoing = definition.outgoing(&node.id);
    match handle {
        Some(handle) => outgoing.into_iter().find(|e| e.branch() == Some(handle)),
        None => {
            if outgoing.len() > 1 {
                warn!(
                    node_id = %node.id,
                    edges = outgoing.len(),
                    "Node has several outgoing edges, following the first"
                );
            }
            outgoing.into_iter().next()
        }
    }
}

fn dangling_edge_reason(edge: &Edge) -> String {
    format!(
        "edge '{}' points to missing node '{}'",
        edge.id, edge.target
    )
}

/// Append a history entry, keeping timestamps non-decreasing.
fn push_history(state: &mut ExecutionState, mut entry: HistoryEntry) {
    if let Some(last) = state.state.history.last() {
        if entry.timestamp < last.timestamp {
            entry.timestamp = last.timestamp;
        }
    }
    state.state.history.push(entry);
}
