//! `SQLite` storage for the planloop runtime.
//!
//! Provides the durable subagent run registry, the tool-call audit log and
//! saved top-level conversations.

mod db;
mod models;
mod queries_audit;
mod queries_sessions;
mod queries_subagents;

pub use db::{Database, DatabaseError};
pub use models::*;
