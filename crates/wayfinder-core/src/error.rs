//! Error types for Wayfinder

use thiserror::Error;

use crate::llm::ProviderError;

/// Result type alias using Wayfinder's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Wayfinder error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Entity errors (E001-E099)
    #[error("Goal '{0}' not found. Run `wayfinder goals list` to see known goals.")]
    GoalNotFound(String),

    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    // Provider errors (E100-E199)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Circuit open for provider '{0}'. Calls are paused until the provider recovers.")]
    CircuitOpen(String),

    #[error("All providers failed for category '{category}': {summary}")]
    AllProvidersFailed { category: String, summary: String },

    // Cost errors (E200-E299)
    #[error("Daily budget exceeded (${0:.2}/${1:.2}). Increase limit with `wayfinder config set cost.daily_limit_usd {2}`.")]
    BudgetExceeded(f64, f64, f64),

    // Validation errors (E300-E399)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // User errors (E700-E799)
    #[error("Operation cancelled by caller")]
    Cancelled,

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Routing errors (E1100-E1199)
    #[error("No suitable model found for task type '{0}'")]
    NoSuitableModel(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::GoalNotFound(_) => "E001",
            Self::InvalidTransition { .. } => "E003",
            Self::Provider(_) => "E100",
            Self::CircuitOpen(_) => "E101",
            Self::AllProvidersFailed { .. } => "E102",
            Self::BudgetExceeded(..) => "E200",
            Self::ValidationFailed(_) => "E300",
            Self::DatabaseError(_) => "E400",
            Self::Persistence(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::Cancelled => "E700",
            Self::InvalidInput(_) => "E800",
            Self::NoSuitableModel(_) => "E1101",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::GoalNotFound(_) => Some("wayfinder goals list".to_string()),
            Self::CircuitOpen(_) => Some("wayfinder providers status".to_string()),
            Self::AllProvidersFailed { .. } => Some("wayfinder providers status".to_string()),
            Self::BudgetExceeded(_, _, suggested) => Some(format!(
                "wayfinder config set cost.daily_limit_usd {}",
                suggested
            )),
            Self::NoSuitableModel(_) => Some("wayfinder models list".to_string()),
            Self::ConfigError(_) => Some("wayfinder config list".to_string()),
            _ => None,
        }
    }

    /// Whether a task attempt that failed with this error may be retried.
    ///
    /// Provider-level faults surface as `AllProvidersFailed`; persistence is
    /// retried by the writer itself and never reaches task retry logic.
    /// `BudgetExceeded` is final: the window does not recover within a
    /// retry schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllProvidersFailed { .. } | Self::Provider(_) | Self::CircuitOpen(_)
        )
    }

    /// A short, caller-facing description with no provider payloads
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(e) => e.short_message(),
            Self::DatabaseError(_) => "storage unavailable".to_string(),
            Self::Io(_) => "I/O failure".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_for_core_taxonomy() {
        let errors = [
            Error::CircuitOpen("openai".into()),
            Error::BudgetExceeded(1.0, 1.0, 1.5),
            Error::AllProvidersFailed {
                category: "chat".into(),
                summary: "none".into(),
            },
            Error::ValidationFailed("empty".into()),
            Error::Persistence("disk full".into()),
            Error::Cancelled,
        ];

        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            Error::AllProvidersFailed {
                category: "chat".into(),
                summary: "x".into()
            }
            .is_retryable()
        );
        assert!(!Error::ValidationFailed("bad".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::NoSuitableModel("chat".into()).is_retryable());
        assert!(!Error::BudgetExceeded(10.0, 10.0, 15.0).is_retryable());
    }

    #[test]
    fn test_budget_suggestion() {
        let err = Error::BudgetExceeded(10.0, 10.0, 15.0);
        assert_eq!(
            err.suggestion().as_deref(),
            Some("wayfinder config set cost.daily_limit_usd 15")
        );
    }

    #[test]
    fn test_user_message_hides_provider_payload() {
        let err = Error::Provider(ProviderError::Http {
            status: 500,
            body: "{\"secret\":\"internal stack\"}".into(),
        });
        let msg = err.user_message();
        assert!(!msg.contains("secret"));
        assert!(msg.contains("500"));
    }
}
