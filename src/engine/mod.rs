//! Execution engine: scheduler, trigger dispatch and delay resumption.

pub mod dispatcher;
pub mod resumer;
mod scheduler;

pub use dispatcher::{LeadEvent, TriggerDispatcher};
pub use resumer::WakeupProcessor;
pub use scheduler::{Scheduler, DEFAULT_MAX_STEPS};
