//! Goal, task and learning record entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::routing::{RouteConstraints, TaskCategory};

/// Lifecycle state of a goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    /// Submitted, waiting for a worker
    #[default]
    Pending,
    /// Being decomposed into tasks
    Planning,
    /// Tasks are running
    Executing,
    /// Acceptance checks are running against the final output
    Validating,
    Completed,
    Failed,
    /// Aborted by the caller
    Cancelled,
}

impl GoalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: GoalState) -> bool {
        use GoalState::*;
        match self {
            Pending => matches!(next, Planning | Cancelled),
            Planning => matches!(next, Executing | Failed | Cancelled),
            Executing => matches!(next, Validating | Failed | Cancelled),
            Validating => matches!(next, Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for GoalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GoalState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "validating" => Ok(Self::Validating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::InvalidInput(format!("unknown goal state '{}'", s))),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// The owning goal was cancelled before this task finished
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            Pending => matches!(next, InProgress | Cancelled),
            InProgress => matches!(next, Succeeded | Failed | Cancelled),
            Succeeded | Failed | Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::InvalidInput(format!("unknown task state '{}'", s))),
        }
    }
}

/// What a task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Ask a model through the router
    Generate,
    /// Run local checks against an earlier task's output
    Validate,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Validate => write!(f, "validate"),
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generate" => Ok(Self::Generate),
            "validate" => Ok(Self::Validate),
            _ => Err(Error::InvalidInput(format!("unknown action type '{}'", s))),
        }
    }
}

/// A local check over a text output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationCheck {
    NonEmpty,
    MinLength { chars: usize },
    MaxLength { chars: usize },
    Contains { text: String },
    /// Output parses as a JSON object holding every key
    JsonWithKeys { keys: Vec<String> },
}

/// A goal-level acceptance check, run in VALIDATING
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcceptanceCheck {
    NonEmpty,
    MinLength { chars: usize },
    MaxLength { chars: usize },
    Contains { text: String },
    JsonWithKeys { keys: Vec<String> },
    /// Ask a model (category `validation`) whether the output satisfies `question`
    ModelConfirmation { question: String },
}

impl AcceptanceCheck {
    /// The equivalent local check, `None` for model confirmation
    pub fn as_local(&self) -> Option<ValidationCheck> {
        match self {
            Self::NonEmpty => Some(ValidationCheck::NonEmpty),
            Self::MinLength { chars } => Some(ValidationCheck::MinLength { chars: *chars }),
            Self::MaxLength { chars } => Some(ValidationCheck::MaxLength { chars: *chars }),
            Self::Contains { text } => Some(ValidationCheck::Contains { text: text.clone() }),
            Self::JsonWithKeys { keys } => Some(ValidationCheck::JsonWithKeys { keys: keys.clone() }),
            Self::ModelConfirmation { .. } => None,
        }
    }
}

impl From<ValidationCheck> for AcceptanceCheck {
    fn from(check: ValidationCheck) -> Self {
        match check {
            ValidationCheck::NonEmpty => Self::NonEmpty,
            ValidationCheck::MinLength { chars } => Self::MinLength { chars },
            ValidationCheck::MaxLength { chars } => Self::MaxLength { chars },
            ValidationCheck::Contains { text } => Self::Contains { text },
            ValidationCheck::JsonWithKeys { keys } => Self::JsonWithKeys { keys },
        }
    }
}

/// Parameters of one task, persisted as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    /// Prompt for GENERATE tasks
    #[serde(default)]
    pub prompt: String,
    /// Routing category for GENERATE tasks
    pub category: TaskCategory,
    #[serde(default)]
    pub constraints: RouteConstraints,
    /// Run together with adjacent parallel tasks
    #[serde(default)]
    pub parallel: bool,
    /// Append the previous task's output to the prompt
    #[serde(default)]
    pub use_previous_output: bool,
    /// Checks for VALIDATE tasks
    #[serde(default)]
    pub checks: Vec<ValidationCheck>,
    /// Position of the task whose output a VALIDATE task checks
    /// (default: the most recent GENERATE output)
    #[serde(default)]
    pub target_position: Option<usize>,
}

impl TaskParameters {
    pub fn generate(prompt: impl Into<String>, category: TaskCategory) -> Self {
        Self {
            prompt: prompt.into(),
            category,
            constraints: RouteConstraints::default(),
            parallel: false,
            use_previous_output: false,
            checks: Vec::new(),
            target_position: None,
        }
    }

    pub fn validate(checks: Vec<ValidationCheck>) -> Self {
        Self {
            checks,
            ..Self::generate("", TaskCategory::Validation)
        }
    }

    pub fn with_constraints(mut self, constraints: RouteConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_previous_output(mut self, use_previous: bool) -> Self {
        self.use_previous_output = use_previous;
        self
    }

    pub fn with_target(mut self, position: usize) -> Self {
        self.target_position = Some(position);
        self
    }
}

/// A task the planner produced, before it is bound to a goal
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub action: ActionType,
    pub parameters: TaskParameters,
}

impl PlannedTask {
    pub fn generate(parameters: TaskParameters) -> Self {
        Self {
            action: ActionType::Generate,
            parameters,
        }
    }

    pub fn validate(parameters: TaskParameters) -> Self {
        Self {
            action: ActionType::Validate,
            parameters,
        }
    }
}

/// One step of a goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal_id: String,
    /// Index in the goal's task list
    pub position: usize,
    pub action: ActionType,
    pub parameters: TaskParameters,
    pub state: TaskState,
    /// Retries consumed so far (the first attempt is not a retry)
    pub retry_count: u32,
    /// Output of a successful task
    pub result: Option<String>,
    /// Human readable failure reason
    pub error: Option<String>,
    /// Model that produced the result
    pub model_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal_id: impl Into<String>, position: usize, planned: PlannedTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            goal_id: goal_id.into(),
            position,
            action: planned.action,
            parameters: planned.parameters,
            state: TaskState::Pending,
            retry_count: 0,
            result: None,
            error: None,
            model_id: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: format!("task {}", self.id),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn category(&self) -> TaskCategory {
        self.parameters.category
    }
}

/// A caller's request for a goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRequest {
    pub description: String,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub acceptance: Vec<AcceptanceCheck>,
    /// Overrides the engine's retry limit for this goal
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl GoalRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: 0,
            acceptance: Vec::new(),
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_acceptance(mut self, check: AcceptanceCheck) -> Self {
        self.acceptance.push(check);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A multi-step objective driven to a terminal state by the goal engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub priority: i32,
    pub state: GoalState,
    /// Task ids in execution order; frozen once the goal is executing
    pub task_ids: Vec<String>,
    pub acceptance: Vec<AcceptanceCheck>,
    pub max_retries: Option<u32>,
    /// Category of the goal's main generate task
    pub category: Option<TaskCategory>,
    /// Model that produced the final output
    pub model_id: Option<String>,
    /// Final output once completed
    pub output: Option<String>,
    /// Human readable reason, set when failed or cancelled
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(request: GoalRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: request.description,
            priority: request.priority,
            state: GoalState::Pending,
            task_ids: Vec::new(),
            acceptance: request.acceptance,
            max_retries: request.max_retries,
            category: None,
            model_id: None,
            output: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: GoalState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: format!("goal {}", self.id),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a task id; only allowed while planning
    pub fn push_task(&mut self, task_id: impl Into<String>) -> Result<()> {
        if self.state != GoalState::Planning {
            return Err(Error::InvalidInput(format!(
                "goal {} task list is frozen in state {}",
                self.id, self.state
            )));
        }
        self.task_ids.push(task_id.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// How a goal ended, as far as learning is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl LearningOutcome {
    /// Outcome for a terminal goal state
    pub fn from_state(state: GoalState) -> Option<Self> {
        match state {
            GoalState::Completed => Some(Self::Completed),
            GoalState::Failed => Some(Self::Failed),
            GoalState::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for LearningOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for LearningOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::InvalidInput(format!("unknown learning outcome '{}'", s))),
        }
    }
}

/// Append-only outcome summary for one finished goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: String,
    pub goal_id: String,
    pub category: TaskCategory,
    /// Model that served the goal's main task, if any was reached
    pub model_id: Option<String>,
    pub outcome: LearningOutcome,
    /// What worked or failed
    pub summary: String,
    /// Derived belief about the (category, model) pair
    pub belief: String,
    /// successes / attempts for the pair across history, in [0, 1]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl LearningRecord {
    pub fn new(
        goal_id: impl Into<String>,
        category: TaskCategory,
        model_id: Option<String>,
        outcome: LearningOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal_id: goal_id.into(),
            category,
            model_id,
            outcome,
            summary: String::new(),
            belief: String::new(),
            confidence: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_belief(mut self, belief: impl Into<String>) -> Self {
        self.belief = belief.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}
