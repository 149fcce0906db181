//! Storage layer - SQLite persistence for goals, tasks and learning records
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//! - `store`: The [`GoalStore`] contract with SQLite and in-memory implementations
//!
//! # Usage
//!
//! ```ignore
//! use wayfinder_core::storage::{Database, DatabaseConfig, SqliteGoalStore};
//!
//! let db = Database::new(DatabaseConfig::with_path("wayfinder.db")).await?;
//! let store = SqliteGoalStore::new(db.pool().clone());
//! ```

pub mod database;
pub mod migrations;
pub mod store;

pub use database::{Database, DatabaseConfig};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
pub use store::{GoalStore, InMemoryGoalStore, SqliteGoalStore};
