//! Error types for the question-answering core

use thiserror::Error;

use crate::budgets::BudgetExceeded;
use crate::guardrail::GuardrailTrip;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, AgentsError>;

/// Main error type for the crate.
///
/// Ordinary operational failures (budget exhaustion, tool errors, malformed
/// model output, timeouts) are absorbed into an `Answer` by the orchestrator.
/// Only guardrail trips configured as fatal and contract violations are
/// expected to reach a caller of `Orchestrator::answer`.
#[derive(Debug, Error)]
pub enum AgentsError {
    /// Tool-call budget exhausted
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// A guardrail monitor tripped and the supervised run was cancelled
    #[error("Guardrail triggered: {}", .0.violation)]
    GuardrailTripped(Box<GuardrailTrip>),

    /// A collaborator broke its contract (programming error)
    #[error("Contract violation: {message}")]
    ContractViolation { message: String },

    /// The decision service failed or answered outside its contract
    #[error("Decision service error: {0}")]
    Decision(String),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// TOML configuration parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),
}

impl From<GuardrailTrip> for AgentsError {
    fn from(trip: GuardrailTrip) -> Self {
        AgentsError::GuardrailTripped(Box::new(trip))
    }
}

impl AgentsError {
    /// Returns the guardrail trip carried by this error, if any.
    pub fn as_guardrail_trip(&self) -> Option<&GuardrailTrip> {
        match self {
            AgentsError::GuardrailTripped(trip) => Some(trip),
            _ => None,
        }
    }

    /// True when the error is a guardrail trip configured to abort the whole call.
    pub fn is_fatal_trip(&self) -> bool {
        self.as_guardrail_trip().is_some_and(|t| t.fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentsError::ContractViolation {
            message: "tool returned an opaque error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Contract violation: tool returned an opaque error"
        );

        let err: AgentsError = BudgetExceeded { limit: 3, used: 3 }.into();
        assert_eq!(err.to_string(), "Tool-call budget exceeded: 3 of 3 used");
    }

    #[test]
    fn test_error_from_openai() {
        let openai_err = async_openai::error::OpenAIError::InvalidArgument("test".to_string());
        let err: AgentsError = openai_err.into();
        assert!(matches!(err, AgentsError::OpenAI(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let parsed: std::result::Result<toml::Value, _> = toml::from_str("not = [valid");
        let err: AgentsError = parsed.unwrap_err().into();
        assert!(matches!(err, AgentsError::Toml(_)));
        assert!(err.as_guardrail_trip().is_none());
    }
}
