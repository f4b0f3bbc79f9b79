//! Trigger dispatcher.
//!
//! Routes external lead events to every active workflow whose TRIGGER node
//! accepts them, and starts manual runs for a single workflow.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::engine::Scheduler;
use crate::error::{Error, Result};
use crate::nodes::trigger;
use crate::storage::ExecutionState;
use crate::workflow::{NodeKind, WorkflowDefinition};

/// An external event about a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadEvent {
    /// Event type, e.g. `lead.created`
    #[serde(rename = "type")]
    pub event_type: String,

    pub lead_id: String,

    #[serde(default)]
    pub payload: Value,
}

impl LeadEvent {
    pub fn new(event_type: impl Into<String>, lead_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            lead_id: lead_id.into(),
            payload,
        }
    }

    /// Execution variables: the payload's fields plus `leadId` and `event`.
    fn variables(&self) -> Map<String, Value> {
        let mut vars = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".into(), other.clone());
                map
            }
        };
        vars.insert("leadId".into(), Value::String(self.lead_id.clone()));
        vars.insert("event".into(), Value::String(self.event_type.clone()));
        vars
    }
}

/// Starts executions from events and manual requests.
#[derive(Clone)]
pub struct TriggerDispatcher {
    scheduler: Scheduler,
}

impl TriggerDispatcher {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Create-or-restart an execution in every active workflow whose trigger
    /// matches the event. A failure in one workflow does not stop the others.
    #[instrument(
        name = "trigger.dispatch",
        skip(self, event),
        fields(event_type = %event.event_type, lead_id = %event.lead_id)
    )]
    pub async fn dispatch(&self, event: &LeadEvent) -> Result<Vec<ExecutionState>> {
        let workflows = self.scheduler.storage().list_active_workflows().await?;
        let mut started = Vec::new();

        for stored in workflows {
            let workflow = stored.definition;
            if !accepts(&workflow, event) {
                continue;
            }

            match self
                .scheduler
                .start_run(&workflow, &event.lead_id, event.variables(), "event")
                .await
            {
                Ok(state) => started.push(state),
                Err(e) => warn!(
                    workflow_id = %workflow.id,
                    error = %e,
                    "Failed to start execution for event"
                ),
            }
        }

        if started.is_empty() {
            debug!("No active workflow matched event");
        } else {
            info!("Event started {} execution(s)", started.len());
        }
        Ok(started)
    }

    /// Start a run of one workflow for a known lead.
    ///
    /// Variables are seeded from the lead record, overlaid with `input`.
    #[instrument(name = "trigger.manual", skip(self, input))]
    pub async fn trigger_manual(
        &self,
        workflow_id: &str,
        lead_id: &str,
        input: Map<String, Value>,
    ) -> Result<ExecutionState> {
        let storage = self.scheduler.storage();

        let stored = storage
            .get_workflow(workflow_id)
            .await?
            .filter(|w| w.is_active())
            .ok_or_else(|| Error::NotFound(format!("active workflow '{}'", workflow_id)))?;

        let lead = storage
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("lead '{}'", lead_id)))?;

        let mut variables = lead.variables();
        variables.extend(input);

        self.scheduler
            .start_run(&stored.definition, lead_id, variables, "manual")
            .await
    }
}

fn accepts(workflow: &WorkflowDefinition, event: &LeadEvent) -> bool {
    match workflow.trigger_node().map(|n| &n.kind) {
        Some(NodeKind::Trigger(data)) => trigger::matches(data, &event.event_type, &event.payload),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::email::testing::RecordingEmailSender;
    use crate::storage::{ExecutionStatus, Lead, SqliteStorage};
    use crate::workflow::parse_workflow;
    use serde_json::json;
    use std::sync::Arc;

    const CREATED: &str = r#"
id: on-created
nodes:
  - { id: T, type: TRIGGER, data: { event: lead.created, filters: { source: [web, ads] } } }
  - { id: E, type: ACTION_EMAIL, data: { subject: "Hi {{name}}", body: b } }
edges:
  - { id: e1, source: T, target: E }
"#;

    const REPLIED: &str = r#"
id: on-replied
nodes:
  - { id: T, type: TRIGGER, data: { event: lead.replied } }
  - { id: E, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: T, target: E }
"#;

    async fn dispatcher() -> (TriggerDispatcher, Arc<RecordingEmailSender>) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        for yaml in [CREATED, REPLIED] {
            storage
                .save_workflow(&parse_workflow(yaml).unwrap())
                .await
                .unwrap();
        }
        let email = Arc::new(RecordingEmailSender::new());
        let scheduler = Scheduler::new(storage, email.clone());
        (TriggerDispatcher::new(scheduler), email)
    }

    #[tokio::test]
    async fn test_dispatch_starts_matching_workflows_only() {
        let (dispatcher, email) = dispatcher().await;
        let event = LeadEvent::new(
            "lead.created",
            "L1",
            json!({"email": "ada@example.com", "name": "Ada", "source": "web"}),
        );

        let started = dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(started.len(), 1);
        let state = &started[0];
        assert_eq!(state.workflow_id, "on-created");
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.variables()["leadId"], "L1");
        assert_eq!(state.variables()["event"], "lead.created");
        assert_eq!(email.sent()[0].subject, "Hi Ada");
    }

    #[tokio::test]
    async fn test_dispatch_respects_filters_and_activation() {
        let (dispatcher, _) = dispatcher().await;

        let filtered = LeadEvent::new("lead.created", "L1", json!({"email": "a@x.io", "source": "referral"}));
        assert!(dispatcher.dispatch(&filtered).await.unwrap().is_empty());

        dispatcher
            .scheduler()
            .storage()
            .set_workflow_active("on-replied", false)
            .await
            .unwrap();
        let replied = LeadEvent::new("lead.replied", "L1", json!({"email": "a@x.io"}));
        assert!(dispatcher.dispatch(&replied).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_returns_failed_execution() {
        let (dispatcher, _) = dispatcher().await;
        // No email variable: the node fails, the FAILED execution is returned.
        let event = LeadEvent::new("lead.replied", "L2", json!({}));
        let started = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_manual_trigger_seeds_from_lead() {
        let (dispatcher, email) = dispatcher().await;
        let storage = dispatcher.scheduler().storage().clone();
        storage
            .upsert_lead(&Lead {
                id: "L1".into(),
                email: Some("ada@example.com".into()),
                name: Some("Ada".into()),
                attributes: Map::new(),
            })
            .await
            .unwrap();

        let input = json!({"name": "Countess"}).as_object().cloned().unwrap();
        let state = dispatcher
            .trigger_manual("on-created", "L1", input)
            .await
            .unwrap();

        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(email.sent()[0].to, "ada@example.com");
        assert_eq!(email.sent()[0].subject, "Hi Countess");
    }

    #[tokio::test]
    async fn test_manual_trigger_not_found_cases() {
        let (dispatcher, _) = dispatcher().await;
        let storage = dispatcher.scheduler().storage().clone();

        let missing_lead = dispatcher.trigger_manual("on-created", "nobody", Map::new()).await;
        assert!(matches!(missing_lead, Err(Error::NotFound(_))));

        storage
            .upsert_lead(&Lead {
                id: "L1".into(),
                email: Some("a@x.io".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let missing_wf = dispatcher.trigger_manual("nope", "L1", Map::new()).await;
        assert!(matches!(missing_wf, Err(Error::NotFound(_))));

        storage.set_workflow_active("on-created", false).await.unwrap();
        let inactive = dispatcher.trigger_manual("on-created", "L1", Map::new()).await;
        assert!(matches!(inactive, Err(Error::NotFound(_))));
    }
}
