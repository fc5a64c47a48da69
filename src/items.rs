//! Items shared by agents, supervisors and the orchestrator
//!
//! `Answer` is the structured output of a run (or of synthesis), `ToolCall`
//! is one immutable entry in a run's ordered call log.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::{Observation, ToolError};

/// Kind of specialised query agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Document search over the text store
    Document,
    /// Graph queries over the graph store
    Graph,
}

impl AgentKind {
    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::Document => "document",
            AgentKind::Graph => "graph",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured answer produced by an agent's finalize step or by synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Answer {
    /// The answer text
    pub text: String,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Source identifiers backing the answer
    #[serde(default)]
    pub sources: BTreeSet<String>,
    /// Short explanation of how the answer was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Answer {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            sources: BTreeSet::new(),
            reasoning: None,
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Terminal "no answer" with zero confidence and an explanation.
    pub fn no_answer(explanation: impl Into<String>) -> Self {
        Self {
            text: "No answer could be produced for this question.".to_string(),
            confidence: 0.0,
            sources: BTreeSet::new(),
            reasoning: Some(explanation.into()),
        }
    }

    /// Check the required fields of a finalized answer.
    ///
    /// Empty text is only accepted for an explicit "unknown": no sources and
    /// a confidence of exactly zero.
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            ));
        }
        if self.text.trim().is_empty() && !(self.sources.is_empty() && self.confidence == 0.0) {
            return Err(
                "answer text is empty; an empty answer requires no sources and confidence 0"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Result recorded for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    Observation(Observation),
    Error(ToolError),
}

/// One entry in a run's call log. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// 1-based; equals `Budget::used` at the time of recording
    pub sequence_index: usize,
    pub tool_name: String,
    pub arguments: Value,
    pub outcome: ToolCallOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn observation(&self) -> Option<&Observation> {
        match &self.outcome {
            ToolCallOutcome::Observation(o) => Some(o),
            ToolCallOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match &self.outcome {
            ToolCallOutcome::Error(e) => Some(e),
            ToolCallOutcome::Observation(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_bounds() {
        assert!(Answer::new("ok", 0.5).validate().is_ok());
        assert!(Answer::new("too sure", 1.5).validate().is_err());
        assert!(Answer::new("negative", -0.1).validate().is_err());
        assert!(Answer::new("nan", f64::NAN).validate().is_err());
    }

    #[test]
    fn test_validate_empty_text() {
        // explicit unknown is fine
        assert!(Answer::new("", 0.0).validate().is_ok());
        // empty text with sources is not
        let a = Answer::new("", 0.0).with_sources(["question_1"]);
        assert!(a.validate().is_err());
        // empty text with confidence is not
        assert!(Answer::new("  ", 0.3).validate().is_err());
    }

    #[test]
    fn test_no_answer_is_valid() {
        let a = Answer::no_answer("both routes failed");
        assert!(a.validate().is_ok());
        assert_eq!(a.confidence, 0.0);
        assert!(a.sources.is_empty());
        assert_eq!(a.reasoning.as_deref(), Some("both routes failed"));
    }

    #[test]
    fn test_sources_are_a_set() {
        let a = Answer::new("x", 0.4).with_sources(["b", "a", "b"]);
        assert_eq!(a.sources.len(), 2);
        assert_eq!(a.sources.iter().next().map(String::as_str), Some("a"));
    }

    #[test]
    fn test_tool_call_serialization() {
        let call = ToolCall {
            sequence_index: 1,
            tool_name: "search_documents".into(),
            arguments: json!({"query": "frustration"}),
            outcome: ToolCallOutcome::Error(ToolError::retryable("store unavailable")),
            timestamp: Utc::now(),
        };
        let v = serde_json::to_value(&call).unwrap();
        assert_eq!(v["outcome"]["kind"], "error");
        assert_eq!(v["outcome"]["retryable"], true);
        assert!(call.is_error());
        assert!(call.observation().is_none());
    }
}
