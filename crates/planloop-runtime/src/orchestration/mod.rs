//! Subagent orchestration: slot pool and run scheduler.
//!
//! - [`SlotPool`]: Semaphore-based ceiling on simultaneously running subagents.
//! - [`SubagentManager`]: Admits queued runs in submission order, drives them
//!   to a terminal state with timeouts and cancellation, and keeps the run
//!   registry current.

pub mod manager;
pub mod pool;

pub use manager::{
    ManagerError, ManagerSettings, RunEvent, SubagentManager, SubagentRequest, SubagentTask,
    TaskFuture,
};
pub use pool::{PoolError, SlotPermit, SlotPool};
