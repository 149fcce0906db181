//! Goal persistence
//!
//! [`GoalStore`] is the contract the goal engine writes through. Writes are
//! upserts so the engine can save the same goal after every transition.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::goals::{
    AcceptanceCheck, ActionType, Goal, GoalState, LearningOutcome, LearningRecord, Task,
    TaskParameters, TaskState,
};
use crate::routing::TaskCategory;

/// Repository trait for goal persistence
#[async_trait]
pub trait GoalStore: Send + Sync {
    /// Insert or update a goal
    async fn save_goal(&self, goal: &Goal) -> Result<()>;

    /// Get a goal by ID
    async fn load_goal(&self, goal_id: &str) -> Result<Option<Goal>>;

    /// Insert or update a task; its goal must already be saved
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Tasks of a goal, ordered by position
    async fn load_tasks(&self, goal_id: &str) -> Result<Vec<Task>>;

    /// Append a learning record
    async fn append_learning(&self, record: &LearningRecord) -> Result<()>;

    /// Every learning record, oldest first
    async fn load_learning(&self) -> Result<Vec<LearningRecord>>;

    /// Most recent goals first
    async fn list_goals(&self, limit: Option<i64>) -> Result<Vec<Goal>>;
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> Error {
    Error::Persistence(format!("invalid {} in storage: {}", what, detail))
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteGoalStore {
    pool: SqlitePool,
}

impl SqliteGoalStore {
    /// Create a new store over a migrated connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct GoalRow {
    id: String,
    description: String,
    priority: i64,
    state: String,
    task_ids: String,
    acceptance: String,
    max_retries: Option<i64>,
    category: Option<String>,
    model_id: Option<String>,
    output: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GoalRow {
    fn into_goal(self) -> Result<Goal> {
        let state: GoalState = self.state.parse().map_err(|e| corrupt("goal state", e))?;
        let task_ids: Vec<String> =
            serde_json::from_str(&self.task_ids).map_err(|e| corrupt("goal task ids", e))?;
        let acceptance: Vec<AcceptanceCheck> =
            serde_json::from_str(&self.acceptance).map_err(|e| corrupt("acceptance checks", e))?;
        let category = self
            .category
            .map(|c| c.parse::<TaskCategory>())
            .transpose()
            .map_err(|e| corrupt("goal category", e))?;

        Ok(Goal {
            id: self.id,
            description: self.description,
            priority: self.priority as i32,
            state,
            task_ids,
            acceptance,
            max_retries: self.max_retries.map(|r| r as u32),
            category,
            model_id: self.model_id,
            output: self.output,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    goal_id: String,
    position: i64,
    action: String,
    parameters: String,
    state: String,
    retry_count: i64,
    result: Option<String>,
    error: Option<String>,
    model_id: Option<String>,
    duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let action: ActionType = self.action.parse().map_err(|e| corrupt("task action", e))?;
        let state: TaskState = self.state.parse().map_err(|e| corrupt("task state", e))?;
        let parameters: TaskParameters =
            serde_json::from_str(&self.parameters).map_err(|e| corrupt("task parameters", e))?;

        Ok(Task {
            id: self.id,
            goal_id: self.goal_id,
            position: self.position as usize,
            action,
            parameters,
            state,
            retry_count: self.retry_count as u32,
            result: self.result,
            error: self.error,
            model_id: self.model_id,
            duration_ms: self.duration_ms.map(|d| d as u64),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LearningRow {
    id: String,
    goal_id: String,
    category: String,
    model_id: Option<String>,
    outcome: String,
    summary: String,
    belief: String,
    confidence: f64,
    created_at: DateTime<Utc>,
}

impl LearningRow {
    fn into_record(self) -> Result<LearningRecord> {
        let category: TaskCategory = self
            .category
            .parse()
            .map_err(|e| corrupt("learning category", e))?;
        let outcome: LearningOutcome = self
            .outcome
            .parse()
            .map_err(|e| corrupt("learning outcome", e))?;

        Ok(LearningRecord {
            id: self.id,
            goal_id: self.goal_id,
            category,
            model_id: self.model_id,
            outcome,
            summary: self.summary,
            belief: self.belief,
            confidence: self.confidence,
            created_at: self.created_at,
        })
    }
}

const GOAL_COLUMNS: &str = "id, description, priority, state, task_ids, acceptance, max_retries, \
     category, model_id, output, failure_reason, created_at, updated_at";

#[async_trait]
impl GoalStore for SqliteGoalStore {
    async fn save_goal(&self, goal: &Goal) -> Result<()> {
        let task_ids = serde_json::to_string(&goal.task_ids)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let acceptance = serde_json::to_string(&goal.acceptance)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO goals (
                id, description, priority, state, task_ids, acceptance, max_retries,
                category, model_id, output, failure_reason, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                priority = excluded.priority,
                state = excluded.state,
                task_ids = excluded.task_ids,
                category = excluded.category,
                model_id = excluded.model_id,
                output = excluded.output,
                failure_reason = excluded.failure_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&goal.id)
        .bind(&goal.description)
        .bind(goal.priority as i64)
        .bind(goal.state.as_str())
        .bind(&task_ids)
        .bind(&acceptance)
        .bind(goal.max_retries.map(|r| r as i64))
        .bind(goal.category.map(|c| c.as_str()))
        .bind(&goal.model_id)
        .bind(&goal.output)
        .bind(&goal.failure_reason)
        .bind(goal.created_at)
        .bind(goal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(())
    }

    async fn load_goal(&self, goal_id: &str) -> Result<Option<Goal>> {
        let row: Option<GoalRow> =
            sqlx::query_as(&format!("SELECT {} FROM goals WHERE id = ?", GOAL_COLUMNS))
                .bind(goal_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;

        row.map(GoalRow::into_goal).transpose()
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let parameters = serde_json::to_string(&task.parameters)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, goal_id, position, action, parameters, state, retry_count,
                result, error, model_id, duration_ms, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                retry_count = excluded.retry_count,
                result = excluded.result,
                error = excluded.error,
                model_id = excluded.model_id,
                duration_ms = excluded.duration_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.goal_id)
        .bind(task.position as i64)
        .bind(task.action.to_string())
        .bind(&parameters)
        .bind(task.state.as_str())
        .bind(task.retry_count as i64)
        .bind(&task.result)
        .bind(&task.error)
        .bind(&task.model_id)
        .bind(task.duration_ms.map(|d| d as i64))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(())
    }

    async fn load_tasks(&self, goal_id: &str) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, goal_id, position, action, parameters, state, retry_count,
                   result, error, model_id, duration_ms, created_at, updated_at
            FROM tasks
            WHERE goal_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn append_learning(&self, record: &LearningRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO learning_records (
                id, goal_id, category, model_id, outcome, summary, belief, confidence, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.goal_id)
        .bind(record.category.as_str())
        .bind(&record.model_id)
        .bind(record.outcome.to_string())
        .bind(&record.summary)
        .bind(&record.belief)
        .bind(record.confidence)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(())
    }

    async fn load_learning(&self) -> Result<Vec<LearningRecord>> {
        let rows: Vec<LearningRow> = sqlx::query_as(
            r#"
            SELECT id, goal_id, category, model_id, outcome, summary, belief, confidence, created_at
            FROM learning_records
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.into_iter().map(LearningRow::into_record).collect()
    }

    async fn list_goals(&self, limit: Option<i64>) -> Result<Vec<Goal>> {
        let rows: Vec<GoalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM goals ORDER BY created_at DESC, rowid DESC LIMIT ?",
            GOAL_COLUMNS
        ))
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.into_iter().map(GoalRow::into_goal).collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    goals: HashMap<String, Goal>,
    tasks: HashMap<String, Task>,
    learning: Vec<LearningRecord>,
    /// Insertion order of goals
    order: Vec<String>,
}

/// Store kept in process memory, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct InMemoryGoalStore {
    state: Mutex<MemoryState>,
    failing_writes: AtomicU32,
}

impl InMemoryGoalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a persistence error
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(Error::Persistence("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GoalStore for InMemoryGoalStore {
    async fn save_goal(&self, goal: &Goal) -> Result<()> {
        self.check_write()?;
        let mut state = self.lock();
        if state.goals.insert(goal.id.clone(), goal.clone()).is_none() {
            state.order.push(goal.id.clone());
        }
        Ok(())
    }

    async fn load_goal(&self, goal_id: &str) -> Result<Option<Goal>> {
        Ok(self.lock().goals.get(goal_id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.check_write()?;
        let mut state = self.lock();
        if !state.goals.contains_key(&task.goal_id) {
            return Err(Error::GoalNotFound(task.goal_id.clone()));
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_tasks(&self, goal_id: &str) -> Result<Vec<Task>> {
        let state = self.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.goal_id == goal_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.position);
        Ok(tasks)
    }

    async fn append_learning(&self, record: &LearningRecord) -> Result<()> {
        self.check_write()?;
        let mut state = self.lock();
        if !state.goals.contains_key(&record.goal_id) {
            return Err(Error::GoalNotFound(record.goal_id.clone()));
        }
        state.learning.push(record.clone());
        Ok(())
    }

    async fn load_learning(&self) -> Result<Vec<LearningRecord>> {
        Ok(self.lock().learning.clone())
    }

    async fn list_goals(&self, limit: Option<i64>) -> Result<Vec<Goal>> {
        let state = self.lock();
        let limit = limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.goals.get(id).cloned())
            .take(limit)
            .collect())
    }
}
