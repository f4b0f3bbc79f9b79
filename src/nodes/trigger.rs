//! TRIGGER node - the entry point of every execution.

use serde_json::Value;

use super::types::{NodeContext, Outcome};
use crate::workflow::TriggerData;

/// Evaluate a TRIGGER node. Acceptance was already decided by the dispatcher.
pub fn execute(_data: &TriggerData, _ctx: &NodeContext) -> Outcome {
    Outcome::Advance(None)
}

/// Decide whether an external event starts this workflow.
///
/// The event type must equal the configured one, and every filter path
/// must resolve in the payload to the expected value. An array filter value
/// means "any of". Triggers without an event only start manually.
pub fn matches(data: &TriggerData, event_type: &str, payload: &Value) -> bool {
    match data.event.as_deref() {
        Some(expected) if expected == event_type => {}
        _ => return false,
    }

    data.filters.iter().all(|(path, expected)| {
        let Some(actual) = lookup(payload, path) else {
            return false;
        };
        match expected {
            Value::Array(options) if !actual.is_array() => options.contains(actual),
            _ => actual == expected,
        }
    })
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
