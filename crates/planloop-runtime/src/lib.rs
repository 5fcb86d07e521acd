//! planloop runtime library
//!
//! Core functionality behind the `planloop` binary and embedders:
//! - Planner loop that batches tool calls and collects their results
//! - Bounded-concurrency subagent scheduler with FIFO admission
//! - `SQLite` run registry and tool-call audit log
//! - Command-line inspection of runs, audit events and policy

pub mod agent;
pub mod cli;
pub mod orchestration;
pub mod storage;
