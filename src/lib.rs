//! leadflow - durable outreach workflow engine
//!
//! leadflow drives each lead through a workflow graph of TRIGGER, DELAY,
//! CONDITION and ACTION_EMAIL nodes. Every `(workflow, lead)` pair has one
//! persisted execution that survives restarts: delays suspend the execution
//! and a durable wake-up resumes it later.
//!
//! ## Example
//!
//! ```yaml
//! id: welcome-drip
//! name: Welcome drip
//!
//! nodes:
//!   - id: start
//!     type: TRIGGER
//!     data: { event: lead.created }
//!   - id: welcome
//!     type: ACTION_EMAIL
//!     data: { subject: "Welcome {{name}}", body: "Glad you're here." }
//!   - id: wait
//!     type: DELAY
//!     data: { delayValue: 3, delayType: days }
//!   - id: engaged
//!     type: CONDITION
//!     data: { condition: "score >= 10" }
//!   - id: call
//!     type: ACTION_EMAIL
//!     data: { subject: "Quick call?", body: "..." }
//!   - id: nurture
//!     type: ACTION_EMAIL
//!     data: { subject: "Some reading", body: "..." }
//!
//! edges:
//!   - { id: e1, source: start, target: welcome }
//!   - { id: e2, source: welcome, target: wait }
//!   - { id: e3, source: wait, target: engaged }
//!   - { id: e4, source: engaged, target: call, handle: "true" }
//!   - { id: e5, source: engaged, target: nurture, handle: "false" }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod nodes;
pub mod storage;
pub mod workflow;

pub use error::{Error, Result};
