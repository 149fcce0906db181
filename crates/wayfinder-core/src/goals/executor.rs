//! Task executor - runs one attempt of one task
//!
//! GENERATE tasks go through the [`Router`]; VALIDATE tasks run local checks
//! against an earlier output. Retries are the goal engine's business.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{ActionType, Task};
use super::validation::run_checks;
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::llm::GenerateRequest;
use crate::routing::{AttemptRecord, RouteConstraints, Router, TaskCategory};

const CONFIRMATION_PROMPT: &str =
    "You check whether an output satisfies a requirement. Answer with a single word: yes or no.";

/// Outputs a task can read from earlier tasks of the same goal
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskInput<'a> {
    /// Output of the most recent task before this one (or before its batch)
    pub previous_output: Option<&'a str>,
    /// Output a VALIDATE task checks
    pub validation_target: Option<&'a str>,
}

/// Result of one successful attempt
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub content: String,
    /// Model that produced the content (none for local validation)
    pub model_id: Option<String>,
    pub cost_usd: f64,
    pub cached: bool,
    pub attempts: Vec<AttemptRecord>,
}

/// Executes single task attempts
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    router: Arc<Router>,
    temperature: Option<f32>,
    max_tokens: Option<usize>,
}

impl TaskExecutor {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Default sampling settings for generated requests
    pub fn with_llm_defaults(mut self, llm: &LlmConfig) -> Self {
        self.temperature = Some(llm.temperature);
        self.max_tokens = Some(llm.max_tokens);
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn request(&self, prompt: String) -> GenerateRequest {
        let mut request = GenerateRequest::new(prompt);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    /// Run one attempt of `task`
    pub async fn execute(
        &self,
        task: &Task,
        input: TaskInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match task.action {
            ActionType::Generate => self.generate(task, input, cancel).await,
            ActionType::Validate => self.validate(task, input),
        }
    }

    async fn generate(
        &self,
        task: &Task,
        input: TaskInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        let params = &task.parameters;
        let prompt = match input.previous_output {
            Some(previous) if params.use_previous_output => {
                format!("{}\n\nPrevious step output:\n{}", params.prompt, previous)
            }
            _ => params.prompt.clone(),
        };
        let request = self.request(prompt);
        let constraints = params.constraints.clone().for_request(&request);

        let decision = self.router.route(params.category, &constraints)?;
        debug!(
            task_id = %task.id,
            category = %params.category,
            model = %decision.model_id(),
            retry = task.retry_count,
            "Executing generate task"
        );
        let response = self.router.execute(&decision, &request, cancel).await?;

        Ok(TaskOutput {
            content: response.content,
            model_id: Some(response.model_id),
            cost_usd: response.cost_usd,
            cached: response.cached,
            attempts: response.attempts,
        })
    }

    fn validate(&self, task: &Task, input: TaskInput<'_>) -> Result<TaskOutput> {
        let target = input
            .validation_target
            .ok_or_else(|| Error::ValidationFailed("no output to validate".to_string()))?;
        run_checks(&task.parameters.checks, target)?;

        Ok(TaskOutput {
            content: format!("{} checks passed", task.parameters.checks.len()),
            model_id: None,
            cost_usd: 0.0,
            cached: false,
            attempts: Vec::new(),
        })
    }

    /// Ask a model (category `validation`) whether `output` satisfies `question`
    pub async fn confirm(
        &self,
        question: &str,
        output: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let request = GenerateRequest::new(format!(
            "Requirement: {}\n\nOutput:\n{}\n\nDoes the output satisfy the requirement?",
            question, output
        ))
        .with_system(CONFIRMATION_PROMPT)
        .with_temperature(0.0)
        .with_max_tokens(8);
        let constraints = RouteConstraints::new().for_request(&request);

        let response = self
            .router
            .route_and_execute(TaskCategory::Validation, &constraints, &request, cancel)
            .await?;
        parse_confirmation(&response.content)
    }
}

/// Read a yes/no answer
pub(crate) fn parse_confirmation(reply: &str) -> Result<bool> {
    let answer = reply
        .trim()
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if answer.starts_with("yes") {
        Ok(true)
    } else if answer.starts_with("no") {
        Ok(false)
    } else {
        Err(Error::ValidationFailed(
            "confirmation reply was neither yes nor no".to_string(),
        ))
    }
}
