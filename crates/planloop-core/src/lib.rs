//! `planloop` Core Library
//!
//! Shared functionality for `planloop` components:
//! - Configuration resolution and hierarchy
//! - Role-based tool authorization policy
//! - `SQLite` pool helpers and timestamps for the run registry
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod permissions;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use permissions::{AuthorizationDecision, AuthorizationPolicy, RolePolicy};
