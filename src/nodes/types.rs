//! Executor outcome and context types.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::workflow::Handle;

/// What the scheduler should do after a node ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Move along an outgoing edge. CONDITION nodes name the branch to take.
    Advance(Option<Handle>),
    /// Park the execution until the given instant.
    Suspend(DateTime<Utc>),
    /// Terminate the execution with a reason.
    Fail(String),
}

impl Outcome {
    /// Short label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Advance(_) => "advance",
            Outcome::Suspend(_) => "suspend",
            Outcome::Fail(_) => "fail",
        }
    }
}

/// Context passed to a node during execution.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub workflow_id: String,
    pub lead_id: String,

    /// Logical "now" for this evaluation
    pub now: DateTime<Utc>,

    /// Execution variables; executors may add to them
    pub variables: Map<String, Value>,
}

impl NodeContext {
    pub fn new(workflow_id: &str, lead_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            lead_id: lead_id.to_string(),
            now,
            variables: Map::new(),
        }
    }

    /// Set variables.
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Look up a variable by dotted path (`lead.score`, `tags.0`).
    pub fn get_variable(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let mut current = self.variables.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_variable_paths() {
        let vars = json!({
            "score": 42,
            "lead": { "company": { "size": 120 } },
            "tags": ["vip", "webinar"]
        });
        let ctx = NodeContext::new("wf", "lead-1", Utc::now())
            .with_variables(vars.as_object().unwrap().clone());

        assert_eq!(ctx.get_variable("score"), Some(&json!(42)));
        assert_eq!(ctx.get_variable("lead.company.size"), Some(&json!(120)));
        assert_eq!(ctx.get_variable("tags.1"), Some(&json!("webinar")));
        assert_eq!(ctx.get_variable("tags.9"), None);
        assert_eq!(ctx.get_variable("lead.missing"), None);
        assert_eq!(ctx.get_variable(""), None);
    }
}
