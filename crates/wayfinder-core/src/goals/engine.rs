//! Goal engine - lifecycle, worker pool, retries and learning
//!
//! A goal moves `pending → planning → executing → validating → completed`.
//! Any unrecoverable task failure or failed acceptance check ends it in
//! `failed`; a caller may cancel it from any non-terminal state. Terminal
//! states never change, and reaching one emits exactly one
//! [`LearningRecord`].
//!
//! Every transition is written through the [`GoalStore`]. A failed write is
//! retried with backoff and then logged; the in-memory state is kept either
//! way. Only the most recent `retain_finished` terminal goals stay in memory;
//! older ones are served from the store.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::{TaskExecutor, TaskInput};
use super::planner::{ModelPlanner, Planner, StepPlanner};
use super::retry::RetryPolicy;
use super::types::{
    AcceptanceCheck, ActionType, Goal, GoalRequest, GoalState, LearningOutcome, LearningRecord,
    Task, TaskState,
};
use crate::config::{Config, EngineConfig, LlmConfig, PlannerKind};
use crate::error::{Error, Result};
use crate::llm::ProviderRegistry;
use crate::routing::{LearningLedger, RouteConstraints, Router, TaskCategory};
use crate::storage::GoalStore;

/// Why a goal stopped short of completion
#[derive(Debug, Clone, PartialEq)]
enum GoalFailure {
    Cancelled,
    Failed(String),
}

impl From<Error> for GoalFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Cancelled => Self::Cancelled,
            other => Self::Failed(other.user_message()),
        }
    }
}

/// Priority queue entry: higher priority first, FIFO within a priority
#[derive(Debug, PartialEq, Eq)]
struct QueuedGoal {
    priority: i32,
    sequence: u64,
    goal_id: String,
}

impl Ord for QueuedGoal {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedGoal {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// In-memory state of one goal
///
/// Lock order: `goal` before `tasks`.
struct GoalSlot {
    goal: Mutex<Goal>,
    tasks: Mutex<Vec<Task>>,
    cancel: CancellationToken,
    /// Set by whichever of a worker or `run_goal` drives the goal
    claimed: AtomicBool,
    state: watch::Sender<GoalState>,
}

impl GoalSlot {
    fn new(goal: Goal) -> Self {
        let (state, _) = watch::channel(goal.state);
        Self {
            goal: Mutex::new(goal),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            claimed: AtomicBool::new(false),
            state,
        }
    }

    fn goal(&self) -> MutexGuard<'_, Goal> {
        self.goal.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> Goal {
        self.goal().clone()
    }

    /// Apply `f` to a task; `None` when the task can no longer change
    fn update_task(&self, index: usize, f: impl FnOnce(&mut Task) -> Result<()>) -> Option<Task> {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(index)?;
        f(task).ok()?;
        Some(task.clone())
    }
}

struct EngineInner {
    store: Arc<dyn GoalStore>,
    router: Arc<Router>,
    executor: TaskExecutor,
    planner: Arc<dyn Planner>,
    config: EngineConfig,
    retry: RetryPolicy,
    persist_policy: RetryPolicy,
    goals: Mutex<HashMap<String, Arc<GoalSlot>>>,
    /// Terminal goals still resident, oldest first
    finished: Mutex<VecDeque<String>>,
    queue: Mutex<BinaryHeap<QueuedGoal>>,
    queued: Notify,
    sequence: AtomicU64,
}

/// Builder for [`GoalEngine`]
pub struct GoalEngineBuilder {
    store: Arc<dyn GoalStore>,
    router: Arc<Router>,
    planner: Option<Arc<dyn Planner>>,
    config: EngineConfig,
    llm: Option<LlmConfig>,
}

impl GoalEngineBuilder {
    /// Set the planner (defaults to [`StepPlanner`])
    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sampling defaults for generated requests
    pub fn llm_defaults(mut self, llm: LlmConfig) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn build(self) -> GoalEngine {
        let mut executor = TaskExecutor::new(self.router.clone());
        if let Some(llm) = &self.llm {
            executor = executor.with_llm_defaults(llm);
        }
        let persist_policy = RetryPolicy::new(
            self.config.persist_retries,
            Duration::from_millis(100),
            Duration::from_secs(2),
        )
        .with_jitter(0.2);

        GoalEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                router: self.router,
                executor,
                planner: self
                    .planner
                    .unwrap_or_else(|| Arc::new(StepPlanner::new())),
                retry: RetryPolicy::from_config(&self.config),
                persist_policy,
                config: self.config,
                goals: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                queue: Mutex::new(BinaryHeap::new()),
                queued: Notify::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }
}

/// Handle to a running worker pool
pub struct EngineHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop pulling new goals and wait for workers to finish their current goal
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker exited abnormally");
            }
        }
        info!("Goal engine stopped");
    }
}

/// Drives goals to a terminal state
#[derive(Clone)]
pub struct GoalEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for GoalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalEngine")
            .field("workers", &self.inner.config.workers)
            .field("goals", &self.inner.goals.lock().map(|g| g.len()).unwrap_or(0))
            .finish()
    }
}

impl GoalEngine {
    pub fn builder(store: Arc<dyn GoalStore>, router: Arc<Router>) -> GoalEngineBuilder {
        GoalEngineBuilder {
            store,
            router,
            planner: None,
            config: EngineConfig::default(),
            llm: None,
        }
    }

    /// Wire an engine from configuration, rebuilding learning statistics from history
    pub async fn from_config(
        config: &Config,
        providers: ProviderRegistry,
        store: Arc<dyn GoalStore>,
    ) -> Result<Self> {
        let history = store.load_learning().await?;
        let learning = Arc::new(LearningLedger::from_records(&history));
        let router = Arc::new(Router::from_config(config, providers, learning)?);

        let steps = StepPlanner::new()
            .with_constraints(RouteConstraints::new().with_prefer_free(config.routing.prefer_free));
        let planner: Arc<dyn Planner> = match config.engine.planner {
            PlannerKind::Step => Arc::new(steps),
            PlannerKind::Model => Arc::new(ModelPlanner::new(router.clone()).with_fallback(steps)),
        };

        info!(
            history = history.len(),
            planner = %config.engine.planner,
            workers = config.engine.workers,
            "Goal engine configured"
        );
        Ok(Self::builder(store, router)
            .planner(planner)
            .config(config.engine.clone())
            .llm_defaults(config.llm.clone())
            .build())
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn learning(&self) -> &Arc<LearningLedger> {
        self.inner.router.learning()
    }

    pub fn store(&self) -> &Arc<dyn GoalStore> {
        &self.inner.store
    }

    fn slot(&self, goal_id: &str) -> Option<Arc<GoalSlot>> {
        self.inner
            .goals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(goal_id)
            .cloned()
    }

    /// Submit a goal with default acceptance and retry settings
    pub async fn submit(&self, description: impl Into<String>, priority: i32) -> Result<String> {
        self.submit_request(GoalRequest::new(description).with_priority(priority))
            .await
    }

    /// Submit a goal and queue it for the workers
    pub async fn submit_request(&self, request: GoalRequest) -> Result<String> {
        if request.description.trim().is_empty() {
            return Err(Error::InvalidInput("goal description is empty".to_string()));
        }

        let goal = Goal::new(request);
        let goal_id = goal.id.clone();
        let priority = goal.priority;
        self.persist_goal(&goal).await;

        self.inner
            .goals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(goal_id.clone(), Arc::new(GoalSlot::new(goal)));

        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(QueuedGoal {
                priority,
                sequence,
                goal_id: goal_id.clone(),
            });
        self.inner.queued.notify_one();

        info!(goal_id = %goal_id, priority, "Goal submitted");
        Ok(goal_id)
    }

    /// Current goal, from memory or storage
    pub async fn get_status(&self, goal_id: &str) -> Result<Goal> {
        if let Some(slot) = self.slot(goal_id) {
            return Ok(slot.snapshot());
        }
        self.inner
            .store
            .load_goal(goal_id)
            .await?
            .ok_or_else(|| Error::GoalNotFound(goal_id.to_string()))
    }

    /// Tasks of a goal in execution order
    pub async fn tasks(&self, goal_id: &str) -> Result<Vec<Task>> {
        if let Some(slot) = self.slot(goal_id) {
            return Ok(slot.tasks().clone());
        }
        if self.inner.store.load_goal(goal_id).await?.is_none() {
            return Err(Error::GoalNotFound(goal_id.to_string()));
        }
        self.inner.store.load_tasks(goal_id).await
    }

    /// Most recent goals first
    pub async fn list_goals(&self, limit: Option<i64>) -> Result<Vec<Goal>> {
        self.inner.store.list_goals(limit).await
    }

    /// Cancel a non-terminal goal
    ///
    /// In-flight router calls and backoff sleeps are aborted; unfinished
    /// tasks become `cancelled`.
    pub async fn cancel(&self, goal_id: &str) -> Result<()> {
        let Some(slot) = self.slot(goal_id) else {
            let goal = self.get_status(goal_id).await?;
            return Err(if goal.is_terminal() {
                terminal_error(&goal)
            } else {
                Error::InvalidInput(format!("goal {} is not owned by this engine", goal_id))
            });
        };

        {
            let goal = slot.goal();
            if goal.is_terminal() {
                return Err(terminal_error(&goal));
            }
        }

        slot.cancel.cancel();
        self.finish(&slot, GoalState::Cancelled, Some("cancelled by caller".to_string()))
            .await;
        Ok(())
    }

    /// Wait until a goal reaches a terminal state
    pub async fn wait(&self, goal_id: &str) -> Result<Goal> {
        let Some(slot) = self.slot(goal_id) else {
            return self.get_status(goal_id).await;
        };
        let mut state = slot.state.subscribe();
        state
            .wait_for(|s| s.is_terminal())
            .await
            .map(|_| ())
            .map_err(|_| Error::Other(format!("goal {} was dropped", goal_id)))?;
        Ok(slot.snapshot())
    }

    /// Drive a submitted goal on the current task instead of a worker
    pub async fn run_goal(&self, goal_id: &str) -> Result<Goal> {
        let Some(slot) = self.slot(goal_id) else {
            return self.get_status(goal_id).await;
        };
        if slot.claimed.swap(true, Ordering::SeqCst) {
            return self.wait(goal_id).await;
        }
        self.drive_isolated(slot.clone()).await;
        Ok(slot.snapshot())
    }

    /// Spawn the worker pool
    pub fn start(&self) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let count = self.inner.config.workers.max(1);
        let workers = (0..count)
            .map(|worker| {
                let engine = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.worker_loop(worker, shutdown).await })
            })
            .collect();

        info!(workers = count, "Goal engine started");
        EngineHandle { shutdown, workers }
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "Worker started");
        loop {
            let slot = tokio::select! {
                _ = shutdown.cancelled() => break,
                slot = self.next_goal() => slot,
            };
            if slot.claimed.swap(true, Ordering::SeqCst) {
                continue;
            }
            self.drive_isolated(slot).await;
        }
        debug!(worker, "Worker stopped");
    }

    async fn next_goal(&self) -> Arc<GoalSlot> {
        loop {
            let notified = self.inner.queued.notified();
            let next = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .pop();
            match next {
                Some(queued) => {
                    if let Some(slot) = self.slot(&queued.goal_id) {
                        return slot;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Drive a goal on its own task; a panic fails the goal, not the caller
    async fn drive_isolated(&self, slot: Arc<GoalSlot>) {
        let engine = self.clone();
        let driven = slot.clone();
        let outcome = tokio::spawn(async move { engine.drive(&driven).await }).await;

        if let Err(e) = outcome {
            let goal_id = slot.goal().id.clone();
            if e.is_panic() {
                error!(goal_id = %goal_id, "Goal driver panicked");
            } else {
                warn!(goal_id = %goal_id, error = %e, "Goal driver aborted");
            }
            self.finish(&slot, GoalState::Failed, Some("internal error".to_string()))
                .await;
        }
    }

    async fn drive(&self, slot: &Arc<GoalSlot>) {
        let cancel = slot.cancel.clone();
        match self.execute_goal(slot, &cancel).await {
            Ok(()) => self.finish(slot, GoalState::Completed, None).await,
            Err(GoalFailure::Cancelled) => {
                self.finish(slot, GoalState::Cancelled, Some("cancelled by caller".to_string()))
                    .await
            }
            Err(GoalFailure::Failed(reason)) => {
                self.finish(slot, GoalState::Failed, Some(reason)).await
            }
        }
    }

    /// Move a live goal forward and persist it
    async fn advance(&self, slot: &GoalSlot, next: GoalState) -> std::result::Result<Goal, GoalFailure> {
        let goal = {
            let mut goal = slot.goal();
            if goal.is_terminal() {
                return Err(GoalFailure::Cancelled);
            }
            goal.transition(next)?;
            goal.clone()
        };
        slot.state.send_replace(next);
        debug!(goal_id = %goal.id, state = %next, "Goal advanced");
        self.persist_goal(&goal).await;
        Ok(goal)
    }

    async fn execute_goal(
        &self,
        slot: &GoalSlot,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), GoalFailure> {
        let goal = self.advance(slot, GoalState::Planning).await?;
        let planned = self.inner.planner.plan(&goal, cancel).await?;
        if planned.is_empty() {
            return Err(GoalFailure::Failed("planner produced no tasks".to_string()));
        }

        let tasks: Vec<Task> = planned
            .into_iter()
            .enumerate()
            .map(|(position, planned)| Task::new(&goal.id, position, planned))
            .collect();
        let goal = {
            let mut goal = slot.goal();
            if goal.is_terminal() {
                return Err(GoalFailure::Cancelled);
            }
            for task in &tasks {
                goal.push_task(&task.id)?;
            }
            goal.category = tasks
                .iter()
                .find(|t| t.action == ActionType::Generate)
                .map(Task::category);
            *slot.tasks() = tasks.clone();
            goal.clone()
        };

        // Tasks are durable before any of them runs
        self.persist_goal(&goal).await;
        for task in &tasks {
            self.persist_task(task).await;
        }
        info!(goal_id = %goal.id, tasks = tasks.len(), "Goal planned");

        let goal = self.advance(slot, GoalState::Executing).await?;
        let policy = match goal.max_retries {
            Some(max) => self.inner.retry.with_max_retries(max),
            None => self.inner.retry,
        };

        let mut index = 0;
        while index < tasks.len() {
            if cancel.is_cancelled() {
                return Err(GoalFailure::Cancelled);
            }
            let end = batch_end(&tasks, index);
            let previous = latest_output(&slot.tasks(), index);

            if end - index == 1 {
                self.run_task(slot, index, &policy, cancel, previous.as_deref())
                    .await?;
            } else {
                debug!(goal_id = %goal.id, from = index, to = end, "Running parallel batch");
                let batch: Vec<BoxFuture<'_, (usize, std::result::Result<(), GoalFailure>)>> = (index
                    ..end)
                    .map(|i| {
                        self.run_task(slot, i, &policy, cancel, previous.as_deref())
                            .map(move |result| (i, result))
                            .boxed()
                    })
                    .collect();
                let mut results: Vec<_> = stream::iter(batch)
                    .buffer_unordered(self.inner.config.max_concurrent_tasks.max(1))
                    .collect()
                    .await;
                results.sort_by_key(|(i, _)| *i);

                if results.iter().any(|(_, r)| *r == Err(GoalFailure::Cancelled)) {
                    return Err(GoalFailure::Cancelled);
                }
                if let Some((_, Err(failure))) = results.into_iter().find(|(_, r)| r.is_err()) {
                    return Err(failure);
                }
            }
            index = end;
        }

        {
            let mut goal = slot.goal();
            let tasks = slot.tasks();
            if let Some(last) = tasks
                .iter()
                .rev()
                .find(|t| t.action == ActionType::Generate && t.state == TaskState::Succeeded)
            {
                goal.output = last.result.clone();
                goal.model_id = last.model_id.clone();
            }
        }

        let goal = self.advance(slot, GoalState::Validating).await?;
        self.check_acceptance(&goal, cancel).await
    }

    /// Run one task to success or final failure, retrying GENERATE attempts
    async fn run_task(
        &self,
        slot: &GoalSlot,
        index: usize,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        previous: Option<&str>,
    ) -> std::result::Result<(), GoalFailure> {
        let (mut task, target) = {
            let mut tasks = slot.tasks();
            let target = validation_target(&tasks, index);
            let task = tasks.get_mut(index).ok_or(GoalFailure::Cancelled)?;
            if task.transition(TaskState::InProgress).is_err() {
                return Err(GoalFailure::Cancelled);
            }
            (task.clone(), target)
        };
        self.persist_task(&task).await;

        let started = Instant::now();
        loop {
            let input = TaskInput {
                previous_output: previous,
                validation_target: target.as_deref(),
            };

            match self.inner.executor.execute(&task, input, cancel).await {
                Ok(output) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    let updated = slot.update_task(index, |t| {
                        t.transition(TaskState::Succeeded)?;
                        t.result = Some(output.content);
                        t.model_id = output.model_id;
                        t.duration_ms = Some(elapsed);
                        Ok(())
                    });
                    let Some(updated) = updated else {
                        return Err(GoalFailure::Cancelled);
                    };
                    debug!(
                        task_id = %updated.id,
                        model = updated.model_id.as_deref().unwrap_or("-"),
                        cost_usd = output.cost_usd,
                        cached = output.cached,
                        "Task succeeded"
                    );
                    self.persist_task(&updated).await;
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(GoalFailure::Cancelled),
                Err(e)
                    if task.action == ActionType::Generate
                        && e.is_retryable()
                        && policy.allows_retry(task.retry_count) =>
                {
                    task.retry_count += 1;
                    let delay = policy.delay_for(task.retry_count);
                    warn!(
                        task_id = %task.id,
                        retry = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e.user_message(),
                        "Task attempt failed, retrying"
                    );
                    let retries = task.retry_count;
                    if let Some(updated) = slot.update_task(index, |t| {
                        t.retry_count = retries;
                        Ok(())
                    }) {
                        self.persist_task(&updated).await;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GoalFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let reason = e.user_message();
                    let elapsed = started.elapsed().as_millis() as u64;
                    if let Some(updated) = slot.update_task(index, |t| {
                        t.transition(TaskState::Failed)?;
                        t.error = Some(reason.clone());
                        t.duration_ms = Some(elapsed);
                        Ok(())
                    }) {
                        self.persist_task(&updated).await;
                    }
                    error!(task_id = %task.id, retries = task.retry_count, error = %reason, "Task failed");

                    let retries = match task.retry_count {
                        0 => String::new(),
                        1 => " after 1 retry".to_string(),
                        n => format!(" after {} retries", n),
                    };
                    return Err(GoalFailure::Failed(format!(
                        "Task {} ({}) failed{}: {}",
                        index + 1,
                        task.action,
                        retries,
                        reason
                    )));
                }
            }
        }
    }

    async fn check_acceptance(
        &self,
        goal: &Goal,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), GoalFailure> {
        let output = goal.output.as_deref().unwrap_or("");
        for check in &goal.acceptance {
            if let Some(local) = check.as_local() {
                local
                    .evaluate(output)
                    .map_err(|reason| GoalFailure::Failed(format!("Acceptance check failed: {}", reason)))?;
                continue;
            }
            let AcceptanceCheck::ModelConfirmation { question } = check else {
                continue;
            };
            match self.inner.executor.confirm(question, output, cancel).await {
                Ok(true) => debug!(goal_id = %goal.id, question = %question, "Model confirmed output"),
                Ok(false) => {
                    return Err(GoalFailure::Failed(format!(
                        "Acceptance check failed: model did not confirm '{}'",
                        question
                    )));
                }
                Err(Error::Cancelled) => return Err(GoalFailure::Cancelled),
                Err(e) => {
                    return Err(GoalFailure::Failed(format!(
                        "Acceptance check failed: {}",
                        e.user_message()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Move a goal to a terminal state, persist it and emit its learning record
    ///
    /// Only the caller that performs the terminal transition gets past the
    /// goal lock, so each goal yields exactly one record.
    async fn finish(&self, slot: &GoalSlot, state: GoalState, reason: Option<String>) {
        let (goal, changed, task_count, succeeded) = {
            let mut goal = slot.goal();
            if goal.is_terminal() {
                return;
            }
            if let Err(e) = goal.transition(state) {
                warn!(goal_id = %goal.id, error = %e, "Goal could not finish");
                return;
            }
            goal.failure_reason = reason.clone();

            let mut tasks = slot.tasks();
            let changed: Vec<Task> = match state {
                GoalState::Cancelled => tasks
                    .iter_mut()
                    .filter(|t| !t.state.is_terminal())
                    .filter_map(|t| t.transition(TaskState::Cancelled).ok().map(|_| t.clone()))
                    .collect(),
                // Only reachable with a task still running when its driver died
                GoalState::Failed => tasks
                    .iter_mut()
                    .filter(|t| t.state == TaskState::InProgress)
                    .filter_map(|t| {
                        t.transition(TaskState::Failed).ok()?;
                        t.error = reason.clone();
                        Some(t.clone())
                    })
                    .collect(),
                _ => Vec::new(),
            };
            let succeeded = tasks
                .iter()
                .filter(|t| t.state == TaskState::Succeeded)
                .count();
            (goal.clone(), changed, tasks.len(), succeeded)
        };

        self.persist_goal(&goal).await;
        for task in &changed {
            self.persist_task(task).await;
        }

        let record = self.learning_record(&goal, task_count, succeeded);
        let store = &self.inner.store;
        let record_ref = &record;
        self.persist("learning record", &goal.id, move || {
            store.append_learning(record_ref)
        })
        .await;

        match state {
            GoalState::Completed => info!(
                goal_id = %goal.id,
                model = goal.model_id.as_deref().unwrap_or("-"),
                confidence = record.confidence,
                "Goal completed"
            ),
            GoalState::Cancelled => info!(goal_id = %goal.id, cancelled_tasks = changed.len(), "Goal cancelled"),
            _ => error!(
                goal_id = %goal.id,
                reason = goal.failure_reason.as_deref().unwrap_or("-"),
                "Goal failed"
            ),
        }

        slot.state.send_replace(state);
        self.retire(&goal.id);
    }

    /// Evict the oldest terminal goals beyond `retain_finished`
    fn retire(&self, goal_id: &str) {
        let evicted: Vec<String> = {
            let mut finished = self
                .inner
                .finished
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            finished.push_back(goal_id.to_string());
            let excess = finished.len().saturating_sub(self.inner.config.retain_finished);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }

        let mut goals = self.inner.goals.lock().unwrap_or_else(|p| p.into_inner());
        for id in &evicted {
            goals.remove(id);
        }
        debug!(evicted = evicted.len(), resident = goals.len(), "Evicted finished goals");
    }

    fn learning_record(&self, goal: &Goal, task_count: usize, succeeded: usize) -> LearningRecord {
        let outcome = LearningOutcome::from_state(goal.state).unwrap_or(LearningOutcome::Failed);
        let category = goal.category.unwrap_or(TaskCategory::Chat);

        let confidence = match &goal.model_id {
            Some(model) => self
                .learning()
                .observe(category, model, outcome)
                .confidence(),
            None => 0.0,
        };

        let summary = match outcome {
            LearningOutcome::Completed => format!(
                "{} of {} tasks succeeded for a {} goal via {}",
                succeeded,
                task_count,
                category,
                goal.model_id.as_deref().unwrap_or("local checks")
            ),
            LearningOutcome::Failed => format!(
                "{} goal failed: {}",
                category,
                goal.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            LearningOutcome::Cancelled => format!(
                "{} goal cancelled after {} of {} tasks",
                category, succeeded, task_count
            ),
        };
        let belief = match (outcome, &goal.model_id) {
            (LearningOutcome::Completed, Some(model)) => {
                format!("{} handles {} goals", model, category)
            }
            (LearningOutcome::Failed, Some(model)) => {
                format!("{} may be unreliable for {} goals", model, category)
            }
            (LearningOutcome::Failed, None) => {
                format!("no {} candidate could serve the goal", category)
            }
            (LearningOutcome::Cancelled, _) => "no signal: cancelled by caller".to_string(),
            (LearningOutcome::Completed, None) => format!("{} goals can complete locally", category),
        };

        LearningRecord::new(&goal.id, category, goal.model_id.clone(), outcome)
            .with_summary(summary)
            .with_belief(belief)
            .with_confidence(confidence)
    }

    /// Run a write, retrying with backoff; never fails the caller
    async fn persist<F, Fut>(&self, what: &str, id: &str, op: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let policy = &self.inner.persist_policy;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return,
                Err(e) if policy.allows_retry(attempt) => {
                    attempt += 1;
                    warn!(what, id, attempt, error = %e, "Persistence failed, retrying");
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                Err(e) => {
                    error!(what, id, error = %e, "Persistence failed, keeping in-memory state");
                    return;
                }
            }
        }
    }

    async fn persist_goal(&self, goal: &Goal) {
        let store = &self.inner.store;
        self.persist("goal", &goal.id, move || store.save_goal(goal))
            .await;
    }

    async fn persist_task(&self, task: &Task) {
        let store = &self.inner.store;
        self.persist("task", &task.id, move || store.save_task(task))
            .await;
    }
}

fn terminal_error(goal: &Goal) -> Error {
    Error::InvalidTransition {
        entity: format!("goal {}", goal.id),
        from: goal.state.to_string(),
        to: GoalState::Cancelled.to_string(),
    }
}

/// End (exclusive) of the batch starting at `index`: a run of parallel
/// GENERATE tasks, or a single task
fn batch_end(tasks: &[Task], index: usize) -> usize {
    if !is_parallel_generate(&tasks[index]) {
        return index + 1;
    }
    let mut end = index + 1;
    while end < tasks.len() && is_parallel_generate(&tasks[end]) {
        end += 1;
    }
    end
}

fn is_parallel_generate(task: &Task) -> bool {
    task.action == ActionType::Generate && task.parameters.parallel
}

/// Output of the most recent succeeded GENERATE task before `index`
///
/// When that task belongs to a parallel batch, the outputs of every
/// succeeded member of the batch are joined in task order.
fn latest_output(tasks: &[Task], index: usize) -> Option<String> {
    let succeeded = |t: &Task| t.state == TaskState::Succeeded && t.action == ActionType::Generate;
    let last = tasks[..index].iter().rposition(succeeded)?;
    if !is_parallel_generate(&tasks[last]) {
        return tasks[last].result.clone();
    }

    let mut first = last;
    while first > 0 && is_parallel_generate(&tasks[first - 1]) {
        first -= 1;
    }
    let outputs: Vec<&str> = tasks[first..=last]
        .iter()
        .filter(|t| succeeded(t))
        .filter_map(|t| t.result.as_deref())
        .collect();
    Some(outputs.join("\n\n"))
}

/// Output a VALIDATE task at `index` checks
fn validation_target(tasks: &[Task], index: usize) -> Option<String> {
    match tasks.get(index)?.parameters.target_position {
        Some(position) if position < tasks.len() => tasks[position].result.clone(),
        Some(_) => None,
        None => latest_output(tasks, index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goals::types::{PlannedTask, TaskParameters};
    use crate::llm::EchoProvider;
    use crate::storage::InMemoryGoalStore;

    async fn offline_engine(store: Arc<InMemoryGoalStore>) -> GoalEngine {
        let providers = ProviderRegistry::new().with_provider(Arc::new(EchoProvider::new("echo")));
        GoalEngine::from_config(&Config::offline(), providers, store)
            .await
            .unwrap()
    }

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        for (priority, sequence) in [(0, 0), (5, 1), (0, 2), (5, 3)] {
            heap.push(QueuedGoal {
                priority,
                sequence,
                goal_id: format!("{}-{}", priority, sequence),
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|q| q.goal_id)).collect();
        assert_eq!(order, vec!["5-1", "5-3", "0-0", "0-2"]);
    }

    #[test]
    fn test_batch_end_groups_parallel_generate_tasks() {
        let parallel = |p: bool| {
            Task::new(
                "g",
                0,
                PlannedTask::generate(TaskParameters::generate("x", TaskCategory::Chat).with_parallel(p)),
            )
        };
        let tasks = vec![parallel(false), parallel(true), parallel(true), parallel(false)];
        assert_eq!(batch_end(&tasks, 0), 1);
        assert_eq!(batch_end(&tasks, 1), 3);
        assert_eq!(batch_end(&tasks, 3), 4);
    }

    fn succeeded(position: usize, parallel: bool, output: &str) -> Task {
        let mut task = Task::new(
            "g",
            position,
            PlannedTask::generate(TaskParameters::generate("x", TaskCategory::Chat).with_parallel(parallel)),
        );
        task.transition(TaskState::InProgress).unwrap();
        task.transition(TaskState::Succeeded).unwrap();
        task.result = Some(output.to_string());
        task
    }

    #[test]
    fn test_latest_output_joins_parallel_batch() {
        let tasks = vec![
            succeeded(0, false, "outline"),
            succeeded(1, true, "intro"),
            succeeded(2, true, "middle"),
            succeeded(3, true, "outro"),
            Task::new("g", 4, PlannedTask::generate(TaskParameters::generate("join", TaskCategory::Chat))),
        ];

        assert_eq!(latest_output(&tasks, 1).as_deref(), Some("outline"));
        assert_eq!(latest_output(&tasks, 4).as_deref(), Some("intro\n\nmiddle\n\noutro"));
        assert_eq!(latest_output(&tasks, 0), None);
    }

    /// Delegates to the step planner, but panics on descriptions asking it to
    struct ExplodingPlanner;

    #[async_trait::async_trait]
    impl Planner for ExplodingPlanner {
        async fn plan(&self, goal: &Goal, _cancel: &CancellationToken) -> Result<Vec<PlannedTask>> {
            if goal.description.contains("explode") {
                panic!("planner exploded");
            }
            StepPlanner::new().plan_description(&goal.description)
        }
    }

    fn engine_with(store: Arc<InMemoryGoalStore>, planner: Arc<dyn Planner>, config: EngineConfig) -> GoalEngine {
        let providers = ProviderRegistry::new().with_provider(Arc::new(EchoProvider::new("echo")));
        let router = Router::from_config(&Config::offline(), providers, Arc::new(LearningLedger::new())).unwrap();
        GoalEngine::builder(store, Arc::new(router))
            .planner(planner)
            .config(config)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_goal_fails_and_worker_survives() {
        let store = Arc::new(InMemoryGoalStore::new());
        let config = EngineConfig {
            workers: 1,
            ..EngineConfig::default()
        };
        let engine = engine_with(store.clone(), Arc::new(ExplodingPlanner), config);
        let handle = engine.start();

        let doomed = engine.submit("explode on purpose", 5).await.unwrap();
        let healthy = engine.submit("Say hello", 0).await.unwrap();

        let goal = engine.wait(&doomed).await.unwrap();
        assert_eq!(goal.state, GoalState::Failed);
        assert_eq!(goal.failure_reason.as_deref(), Some("internal error"));

        // The single worker is still alive to run the next goal
        let goal = engine.wait(&healthy).await.unwrap();
        assert_eq!(goal.state, GoalState::Completed);

        let records = store.load_learning().await.unwrap();
        assert_eq!(records.iter().filter(|r| r.goal_id == doomed).count(), 1);
        assert_eq!(
            store.load_goal(&doomed).await.unwrap().unwrap().state,
            GoalState::Failed
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ascii_description_completes() {
        let engine = offline_engine(Arc::new(InMemoryGoalStore::new())).await;
        let handle = engine.start();

        let id = engine.submit("İİİ then x", 0).await.unwrap();
        let goal = tokio::time::timeout(Duration::from_secs(3), engine.wait(&id))
            .await
            .expect("goal should reach a terminal state")
            .unwrap();
        assert_eq!(goal.state, GoalState::Completed);

        let tasks = engine.tasks(&id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].parameters.prompt, "İİİ");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_goals_are_evicted_beyond_retention() {
        let store = Arc::new(InMemoryGoalStore::new());
        let config = EngineConfig {
            retain_finished: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with(store.clone(), Arc::new(StepPlanner::new()), config);

        let mut ids = Vec::new();
        for i in 0..5 {
            let id = engine.submit(format!("Say hello {}", i), 0).await.unwrap();
            assert_eq!(engine.run_goal(&id).await.unwrap().state, GoalState::Completed);
            ids.push(id);
        }

        let resident = engine.inner.goals.lock().unwrap().len();
        assert_eq!(resident, 2);
        assert!(engine.slot(&ids[0]).is_none());
        assert!(engine.slot(&ids[4]).is_some());

        // Evicted goals are still served from the store
        let goal = engine.wait(&ids[0]).await.unwrap();
        assert_eq!(goal.state, GoalState::Completed);
        assert_eq!(engine.tasks(&ids[0]).await.unwrap().len(), 2);
        assert!(matches!(engine.cancel(&ids[0]).await, Err(Error::InvalidTransition { .. })));
        assert_eq!(store.load_learning().await.unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_goal_completes_and_records_learning() {
        let store = Arc::new(InMemoryGoalStore::new());
        let engine = offline_engine(store.clone()).await;

        let id = engine.submit("Write a greeting, then shorten it", 0).await.unwrap();
        let goal = engine.run_goal(&id).await.unwrap();

        assert_eq!(goal.state, GoalState::Completed);
        assert_eq!(goal.model_id.as_deref(), Some("echo/default"));
        assert!(goal.output.is_some());

        let tasks = engine.tasks(&id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.state == TaskState::Succeeded));

        let records = store.load_learning().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, LearningOutcome::Completed);
        assert_eq!(records[0].confidence, 1.0);

        let persisted = store.load_goal(&id).await.unwrap().unwrap();
        assert_eq!(persisted.state, GoalState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_description_rejected() {
        let engine = offline_engine(Arc::new(InMemoryGoalStore::new())).await;
        assert!(matches!(engine.submit("  ", 0).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_goal() {
        let engine = offline_engine(Arc::new(InMemoryGoalStore::new())).await;
        assert!(matches!(engine.get_status("nope").await, Err(Error::GoalNotFound(_))));
        assert!(matches!(engine.tasks("nope").await, Err(Error::GoalNotFound(_))));
        assert!(matches!(engine.cancel("nope").await, Err(Error::GoalNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_goal() {
        let store = Arc::new(InMemoryGoalStore::new());
        let engine = offline_engine(store.clone()).await;

        let id = engine.submit("Say hello", 0).await.unwrap();
        engine.cancel(&id).await.unwrap();

        let goal = engine.get_status(&id).await.unwrap();
        assert_eq!(goal.state, GoalState::Cancelled);
        assert_eq!(goal.failure_reason.as_deref(), Some("cancelled by caller"));

        // Driving a cancelled goal changes nothing
        let goal = engine.run_goal(&id).await.unwrap();
        assert_eq!(goal.state, GoalState::Cancelled);

        let records = store.load_learning().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, LearningOutcome::Cancelled);

        assert!(matches!(engine.cancel(&id).await, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptance_failure_fails_goal() {
        let engine = offline_engine(Arc::new(InMemoryGoalStore::new())).await;
        let id = engine
            .submit_request(
                GoalRequest::new("Say hello")
                    .with_acceptance(AcceptanceCheck::Contains { text: "goodbye".into() }),
            )
            .await
            .unwrap();

        let goal = engine.run_goal(&id).await.unwrap();
        assert_eq!(goal.state, GoalState::Failed);
        assert_eq!(
            goal.failure_reason.as_deref(),
            Some("Acceptance check failed: output does not contain 'goodbye'")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_drain_queue() {
        let engine = offline_engine(Arc::new(InMemoryGoalStore::new())).await;
        let handle = engine.start();
        assert_eq!(handle.worker_count(), 4);

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(engine.submit(format!("Say hello {}", i), i).await.unwrap());
        }
        for id in &ids {
            assert_eq!(engine.wait(id).await.unwrap().state, GoalState::Completed);
        }

        handle.shutdown().await;
        assert_eq!(engine.list_goals(None).await.unwrap().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failures_are_retried() {
        let store = Arc::new(InMemoryGoalStore::new());
        let engine = offline_engine(store.clone()).await;

        store.fail_next_writes(2);
        let id = engine.submit("Say hello", 0).await.unwrap();
        assert!(store.load_goal(&id).await.unwrap().is_some());

        let goal = engine.run_goal(&id).await.unwrap();
        assert_eq!(goal.state, GoalState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_exhaustion_keeps_memory_state() {
        let store = Arc::new(InMemoryGoalStore::new());
        let engine = offline_engine(store.clone()).await;

        store.fail_next_writes(4);
        let id = engine.submit("Say hello", 0).await.unwrap();
        assert!(store.load_goal(&id).await.unwrap().is_none());
        assert_eq!(engine.get_status(&id).await.unwrap().state, GoalState::Pending);
    }
}
