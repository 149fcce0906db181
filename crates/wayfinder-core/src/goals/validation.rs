//! Local output checks for VALIDATE tasks and goal acceptance

use crate::error::{Error, Result};

use super::types::ValidationCheck;

impl ValidationCheck {
    /// Check `output`, returning a short reason on failure
    pub fn evaluate(&self, output: &str) -> std::result::Result<(), String> {
        let chars = output.trim().chars().count();
        match self {
            Self::NonEmpty if chars == 0 => Err("output is empty".to_string()),
            Self::MinLength { chars: min } if chars < *min => Err(format!(
                "output has {} characters, expected at least {}",
                chars, min
            )),
            Self::MaxLength { chars: max } if chars > *max => Err(format!(
                "output has {} characters, expected at most {}",
                chars, max
            )),
            Self::Contains { text } if !output.contains(text.as_str()) => {
                Err(format!("output does not contain '{}'", text))
            }
            Self::JsonWithKeys { keys } => check_json_keys(output, keys),
            _ => Ok(()),
        }
    }
}

fn check_json_keys(output: &str, keys: &[String]) -> std::result::Result<(), String> {
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(output))
        .map_err(|_| "output is not valid JSON".to_string())?;
    let Some(object) = value.as_object() else {
        return Err("output is not a JSON object".to_string());
    };
    let missing: Vec<&str> = keys
        .iter()
        .filter(|k| !object.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("JSON output is missing keys: {}", missing.join(", ")))
    }
}

/// Models often wrap JSON in a ```json fence
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Run every check, failing on the first one that does not pass
pub fn run_checks(checks: &[ValidationCheck], output: &str) -> Result<()> {
    for check in checks {
        check.evaluate(output).map_err(Error::ValidationFailed)?;
    }
    Ok(())
}
