//! Storage layer for workflows, leads, executions and wake-ups.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
