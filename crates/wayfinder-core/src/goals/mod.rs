//! Goal execution
//!
//! A goal is a natural-language objective. The [`Planner`] turns it into an
//! ordered list of tasks, the [`TaskExecutor`] runs each task through the
//! router, and the [`GoalEngine`] owns the lifecycle: queueing, retries,
//! acceptance checks, persistence and the learning record written when the
//! goal finishes.
//!
//! ```rust,ignore
//! use wayfinder_core::goals::GoalEngine;
//!
//! let engine = GoalEngine::from_config(&config, providers, store).await?;
//! let handle = engine.start();
//! let goal_id = engine.submit("Summarize the release notes", 0).await?;
//! let goal = engine.wait(&goal_id).await?;
//! handle.shutdown().await;
//! ```

mod engine;
mod executor;
mod planner;
mod retry;
mod types;
mod validation;

pub use engine::{EngineHandle, GoalEngine, GoalEngineBuilder};
pub use executor::{TaskExecutor, TaskInput, TaskOutput};
pub use planner::{ModelPlanner, Planner, StepPlanner, classify, split_steps};
pub use retry::RetryPolicy;
pub use types::{
    AcceptanceCheck, ActionType, Goal, GoalRequest, GoalState, LearningOutcome, LearningRecord,
    PlannedTask, Task, TaskParameters, TaskState, ValidationCheck,
};
pub use validation::run_checks;
