//! Workflow definition, parsing, and validation.
//!
//! A workflow is a directed graph:
//! - Nodes: typed steps (TRIGGER, ACTION_EMAIL, DELAY, CONDITION)
//! - Edges: directed links, with a `true`/`false` handle on CONDITION branches

mod parser;
mod types;
mod validator;

pub use parser::{parse_workflow, parse_workflow_file};
pub use types::*;
pub use validator::{validate_workflow, GraphValidationError, Violation};
