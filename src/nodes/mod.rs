//! Node executors.
//!
//! One executor per node kind. Executors decide what happens next
//! ([`Outcome`]) but never touch storage; the scheduler applies the outcome.

pub mod condition;
pub mod delay;
pub mod email;
pub mod template;
pub mod trigger;
mod types;

pub use email::{
    email_sender_from_config, BackoffType, EmailMessage, EmailReceipt, EmailSender,
    LogEmailSender, ResendEmailSender, RetryPolicy, RetryingEmailSender,
};
pub use types::{NodeContext, Outcome};

use crate::workflow::{Node, NodeKind};

/// Run the executor for a node.
pub async fn execute_node(node: &Node, ctx: &mut NodeContext, sender: &dyn EmailSender) -> Outcome {
    match &node.kind {
        NodeKind::Trigger(data) => trigger::execute(data, ctx),
        NodeKind::Delay(data) => delay::execute(data, ctx),
        NodeKind::Condition(data) => condition::execute(data, ctx),
        NodeKind::ActionEmail(data) => email::execute(data, ctx, sender).await,
    }
}
