//! Wayfinder Core Library
//!
//! This crate provides the core functionality for Wayfinder, including:
//! - LLM provider clients (OpenAI-compatible, Anthropic, offline echo)
//! - Model routing with fallback, circuit breakers and a response cache
//! - Cost tracking and budget enforcement
//! - Goal planning and execution with retries
//! - Storage (SQLite) for goals, tasks and learning records

pub mod config;
pub mod cost;
pub mod error;
pub mod goals;
pub mod llm;
pub mod routing;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::goals::{Goal, GoalEngine, GoalRequest, GoalState};
    pub use crate::routing::{Router, TaskCategory};
}
