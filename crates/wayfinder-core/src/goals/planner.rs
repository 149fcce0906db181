//! Goal decomposition
//!
//! [`StepPlanner`] splits the description locally. [`ModelPlanner`] asks a
//! model for a step list and falls back to [`StepPlanner`] when the answer is
//! unusable. Both end the plan with a VALIDATE task that checks the final
//! output is non-empty.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{Goal, PlannedTask, TaskParameters, ValidationCheck};
use super::validation::strip_code_fence;
use crate::error::{Error, Result};
use crate::llm::GenerateRequest;
use crate::routing::{RouteConstraints, Router, TaskCategory};

/// Turns a goal into an ordered list of tasks
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &Goal, cancel: &CancellationToken) -> Result<Vec<PlannedTask>>;
}

/// Guess a routing category from keywords
pub fn classify(text: &str) -> TaskCategory {
    const KEYWORDS: &[(TaskCategory, &[&str])] = &[
        (
            TaskCategory::Coding,
            &[
                "code", "function", "implement", "refactor", "bug", "compile", "rust", "python",
                "script", "api", "sql", "test case",
            ],
        ),
        (
            TaskCategory::Summarization,
            &["summarize", "summarise", "summary", "tl;dr", "condense", "shorten"],
        ),
        (
            TaskCategory::Planning,
            &["plan", "roadmap", "outline", "schedule", "milestone"],
        ),
        (
            TaskCategory::Reasoning,
            &["why", "prove", "reason", "analyze", "analyse", "calculate", "solve", "compare"],
        ),
    ];

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != ';')
        .filter(|w| !w.is_empty())
        .collect();

    KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|k| {
                if k.contains(' ') || k.contains(';') {
                    lower.contains(k)
                } else {
                    words.iter().any(|w| w == k || w.strip_suffix('s') == Some(k))
                }
            })
        })
        .map(|(category, _)| *category)
        .unwrap_or(TaskCategory::Chat)
}

/// Strip a list marker ("1.", "2)", "-", "*", "•") from a line
fn list_item(line: &str) -> Option<&str> {
    let line = line.trim();
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return Some(rest.trim());
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .map(str::trim)
}

const THEN: &[u8] = b" then ";

/// Byte offsets of non-overlapping " then " separators, ignoring ASCII case
///
/// Matching on the original bytes keeps offsets valid for slicing: the
/// separator is ASCII, so a match never starts or ends inside a multi-byte
/// character.
fn then_separators(description: &str) -> Vec<usize> {
    let bytes = description.as_bytes();
    let mut offsets = Vec::new();
    let mut i = 0;
    while i + THEN.len() <= bytes.len() {
        if bytes[i..i + THEN.len()].eq_ignore_ascii_case(THEN) {
            offsets.push(i);
            i += THEN.len();
        } else {
            i += 1;
        }
    }
    offsets
}

/// Split a description into steps: list items, else "then" clauses, else the whole text
pub fn split_steps(description: &str) -> Vec<String> {
    let items: Vec<String> = description
        .lines()
        .filter_map(list_item)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.len() >= 2 {
        return items;
    }

    let mut clauses = Vec::new();
    let mut start = 0;
    for index in then_separators(description) {
        clauses.push(&description[start..index]);
        start = index + THEN.len();
    }
    clauses.push(&description[start..]);

    let clauses: Vec<String> = clauses
        .into_iter()
        .map(|c| c.trim().trim_end_matches(',').trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if clauses.len() >= 2 {
        return clauses;
    }

    let whole = description.trim();
    if whole.is_empty() {
        Vec::new()
    } else {
        vec![whole.to_string()]
    }
}

fn final_check() -> PlannedTask {
    PlannedTask::validate(TaskParameters::validate(vec![ValidationCheck::NonEmpty]))
}

/// Keyword-driven local planner
#[derive(Debug, Clone, Default)]
pub struct StepPlanner {
    constraints: RouteConstraints,
}

impl StepPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constraints applied to every generated task
    pub fn with_constraints(mut self, constraints: RouteConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn plan_description(&self, description: &str) -> Result<Vec<PlannedTask>> {
        let steps = split_steps(description);
        if steps.is_empty() {
            return Err(Error::InvalidInput("goal description is empty".to_string()));
        }

        let mut tasks: Vec<PlannedTask> = steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                PlannedTask::generate(
                    TaskParameters::generate(step.clone(), classify(step))
                        .with_constraints(self.constraints.clone())
                        .with_previous_output(index > 0),
                )
            })
            .collect();
        tasks.push(final_check());

        debug!(steps = steps.len(), "Planned goal locally");
        Ok(tasks)
    }
}

#[async_trait]
impl Planner for StepPlanner {
    async fn plan(&self, goal: &Goal, _cancel: &CancellationToken) -> Result<Vec<PlannedTask>> {
        self.plan_description(&goal.description)
    }
}

const PLANNING_PROMPT: &str = "Break the user's goal into a short sequence of concrete steps. \
Reply with only a JSON array of objects with the fields \"prompt\" (string), \
\"category\" (one of chat, coding, reasoning, summarization, planning) and \
\"parallel\" (true when the step does not depend on the step before it).";

#[derive(Debug, Deserialize)]
struct ModelStep {
    #[serde(alias = "step", alias = "description")]
    prompt: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    parallel: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelPlan {
    Steps(Vec<ModelStep>),
    Wrapped { steps: Vec<ModelStep> },
}

/// Planner that asks a model (category `planning`) for the step list
pub struct ModelPlanner {
    router: Arc<Router>,
    fallback: StepPlanner,
}

impl ModelPlanner {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            fallback: StepPlanner::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: StepPlanner) -> Self {
        self.fallback = fallback;
        self
    }

    /// Parse a model reply into planned tasks, `None` when unusable
    pub fn parse_reply(&self, reply: &str) -> Option<Vec<PlannedTask>> {
        let body = strip_code_fence(reply);

        let steps: Vec<(String, Option<String>, bool)> = match serde_json::from_str::<ModelPlan>(body) {
            Ok(ModelPlan::Steps(steps)) | Ok(ModelPlan::Wrapped { steps }) => steps
                .into_iter()
                .map(|s| (s.prompt, s.category, s.parallel))
                .collect(),
            Err(_) => reply
                .lines()
                .filter_map(list_item)
                .filter(|s| !s.is_empty())
                .map(|s| (s.to_string(), None, false))
                .collect(),
        };

        let steps: Vec<_> = steps
            .into_iter()
            .filter(|(prompt, _, _)| !prompt.trim().is_empty())
            .collect();
        if steps.is_empty() {
            return None;
        }

        let mut tasks: Vec<PlannedTask> = steps
            .into_iter()
            .enumerate()
            .map(|(index, (prompt, category, parallel))| {
                let category = category
                    .and_then(|c| c.parse::<TaskCategory>().ok())
                    .filter(|c| *c != TaskCategory::Validation)
                    .unwrap_or_else(|| classify(&prompt));
                PlannedTask::generate(
                    TaskParameters::generate(prompt.trim(), category)
                        .with_constraints(self.fallback.constraints.clone())
                        .with_parallel(parallel)
                        .with_previous_output(index > 0 && !parallel),
                )
            })
            .collect();
        tasks.push(final_check());
        Some(tasks)
    }
}

#[async_trait]
impl Planner for ModelPlanner {
    async fn plan(&self, goal: &Goal, cancel: &CancellationToken) -> Result<Vec<PlannedTask>> {
        if goal.description.trim().is_empty() {
            return Err(Error::InvalidInput("goal description is empty".to_string()));
        }

        let request = GenerateRequest::new(goal.description.clone())
            .with_system(PLANNING_PROMPT)
            .with_temperature(0.2);
        let constraints = RouteConstraints::new().for_request(&request);

        match self
            .router
            .route_and_execute(TaskCategory::Planning, &constraints, &request, cancel)
            .await
        {
            Ok(response) => {
                if let Some(tasks) = self.parse_reply(&response.content) {
                    debug!(goal_id = %goal.id, model = %response.model_id, tasks = tasks.len(), "Planned goal with model");
                    return Ok(tasks);
                }
                warn!(goal_id = %goal.id, model = %response.model_id, "Planner reply unusable, planning locally");
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(goal_id = %goal.id, error = %e, "Model planning failed, planning locally");
            }
        }

        self.fallback.plan_description(&goal.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goals::types::ActionType;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(classify("Implement a function that parses dates"), TaskCategory::Coding);
        assert_eq!(classify("Summarize the meeting notes"), TaskCategory::Summarization);
        assert_eq!(classify("Explain why the sky is blue"), TaskCategory::Reasoning);
        assert_eq!(classify("Draft a roadmap for Q3"), TaskCategory::Planning);
        assert_eq!(classify("Say hello"), TaskCategory::Chat);
    }

    #[test]
    fn test_split_numbered_and_bulleted_lines() {
        let steps = split_steps("Do this:\n1. write a poem\n2) translate it\n");
        assert_eq!(steps, vec!["write a poem", "translate it"]);

        let steps = split_steps("- outline\n* draft\n• polish");
        assert_eq!(steps, vec!["outline", "draft", "polish"]);
    }

    #[test]
    fn test_split_then_clauses() {
        let steps = split_steps("Write a haiku about rust, then translate it to French");
        assert_eq!(steps, vec!["Write a haiku about rust", "translate it to French"]);
    }

    #[test]
    fn test_split_then_with_non_ascii_text() {
        // 'İ' grows from two to three bytes when lowercased
        assert_eq!(split_steps("İİİ then x"), vec!["İİİ", "x"]);
        assert_eq!(
            split_steps("Résumé the Straße notes THEN übersetze sie"),
            vec!["Résumé the Straße notes", "übersetze sie"]
        );
        assert_eq!(split_steps("İstanbul gezisi"), vec!["İstanbul gezisi"]);
    }

    #[test]
    fn test_single_step_and_empty() {
        assert_eq!(split_steps("  Say hello  "), vec!["Say hello"]);
        assert!(split_steps("   ").is_empty());
        assert!(StepPlanner::new().plan_description("").is_err());
    }

    #[test]
    fn test_step_planner_chains_outputs_and_appends_validation() {
        let tasks = StepPlanner::new()
            .plan_description("1. implement the parser\n2. summarize the design")
            .unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].parameters.category, TaskCategory::Coding);
        assert!(!tasks[0].parameters.use_previous_output);
        assert_eq!(tasks[1].parameters.category, TaskCategory::Summarization);
        assert!(tasks[1].parameters.use_previous_output);
        assert_eq!(tasks[2].action, ActionType::Validate);
        assert_eq!(tasks[2].parameters.checks, vec![ValidationCheck::NonEmpty]);
    }

    fn model_planner() -> ModelPlanner {
        let config = crate::config::Config::offline();
        let router = Router::from_config(
            &config,
            crate::llm::ProviderRegistry::new(),
            Arc::default(),
        )
        .unwrap();
        ModelPlanner::new(Arc::new(router))
    }

    #[test]
    fn test_parse_json_reply() {
        let reply = r#"```json
[{"prompt": "write the code", "category": "coding"},
 {"prompt": "write docs", "category": "nonsense", "parallel": true}]
```"#;
        let tasks = model_planner().parse_reply(reply).unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].parameters.category, TaskCategory::Coding);
        assert!(tasks[1].parameters.parallel);
        assert!(!tasks[1].parameters.use_previous_output);
        assert_eq!(tasks[1].parameters.category, TaskCategory::Chat);
    }

    #[test]
    fn test_parse_wrapped_and_numbered_replies() {
        let planner = model_planner();
        let tasks = planner
            .parse_reply(r#"{"steps": [{"step": "plan the trip"}]}"#)
            .unwrap();
        assert_eq!(tasks[0].parameters.prompt, "plan the trip");

        let tasks = planner.parse_reply("Sure!\n1. first\n2. second").unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(planner.parse_reply("I can't help with that.").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_planner_falls_back_without_providers() {
        let goal = Goal::new(crate::goals::GoalRequest::new("write a poem, then shorten it"));
        let tasks = model_planner()
            .plan(&goal, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[1].parameters.category, TaskCategory::Summarization);
    }
}
