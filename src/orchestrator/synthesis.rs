//! Order-independent synthesis of branch outcomes into one answer
//!
//! Outcomes are sorted by agent kind before anything else happens, so the
//! result never depends on which branch finished first.
//!
//! - two answers: sources are unioned, confidence is `(a² + b²) / (a + b)`,
//!   texts are concatenated document first, and a large confidence gap is
//!   called out
//! - one answer: adopted unchanged, plus a note about the other branch
//! - no answer: a zero-confidence "no answer" explaining every branch

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentRun, RunStatus};
use crate::config::SynthesisConfig;
use crate::guardrail::GuardrailViolation;
use crate::items::{AgentKind, Answer};
use crate::usage::Usage;

/// How one routed branch ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchResult {
    Answered { answer: Answer },
    BudgetExceeded { limit: usize, salvaged: Option<Answer> },
    Failed { reason: String },
    Cancelled,
    TimedOut,
    Tripped { violation: GuardrailViolation },
    /// No agent of this kind is configured
    Unavailable,
}

impl BranchResult {
    pub fn answer(&self) -> Option<&Answer> {
        match self {
            BranchResult::Answered { answer } => Some(answer),
            _ => None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answer().is_some()
    }
}

/// One branch of an orchestrated call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOutcome {
    pub kind: AgentKind,
    pub result: BranchResult,
    pub run_id: Option<Uuid>,
    pub tool_calls: usize,
    pub usage: Usage,
}

impl BranchOutcome {
    pub fn new(kind: AgentKind, result: BranchResult) -> Self {
        Self {
            kind,
            result,
            run_id: None,
            tool_calls: 0,
            usage: Usage::empty(),
        }
    }

    pub fn unavailable(kind: AgentKind) -> Self {
        Self::new(kind, BranchResult::Unavailable)
    }

    /// Classify a finished run.
    pub fn from_run(run: AgentRun) -> Self {
        let result = match run.status {
            RunStatus::Finalized => match run.result {
                Some(answer) => BranchResult::Answered { answer },
                None => BranchResult::Failed {
                    reason: "run finalized without an answer".to_string(),
                },
            },
            RunStatus::BudgetExceeded => BranchResult::BudgetExceeded {
                limit: run.budget.limit(),
                salvaged: run.result,
            },
            RunStatus::Failed => BranchResult::Failed {
                reason: run.failure.unwrap_or_else(|| "unknown failure".to_string()),
            },
            RunStatus::Cancelled => BranchResult::Cancelled,
            RunStatus::Running => BranchResult::Failed {
                reason: "run returned before reaching a terminal status".to_string(),
            },
        };
        Self {
            kind: run.kind,
            result,
            run_id: Some(run.id),
            tool_calls: run.calls.len(),
            usage: run.usage,
        }
    }
}

/// Human-readable note about a branch that produced no usable answer.
struct Limitation<'a>(&'a BranchOutcome);

impl fmt::Display for Limitation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.0.kind;
        match &self.0.result {
            BranchResult::Answered { .. } => write!(f, "The {} route answered.", kind),
            BranchResult::BudgetExceeded { limit, .. } => write!(
                f,
                "The {} route exhausted its tool-call budget ({} calls) before answering.",
                kind, limit
            ),
            BranchResult::Failed { reason } => write!(f, "The {} route failed: {}.", kind, reason),
            BranchResult::Cancelled => write!(f, "The {} route was cancelled.", kind),
            BranchResult::TimedOut => {
                write!(f, "The {} route did not finish before the deadline.", kind)
            }
            BranchResult::Tripped { violation } => write!(
                f,
                "The {} route was stopped by guardrail {}: {}.",
                kind, violation.monitor_name, violation.reason
            ),
            BranchResult::Unavailable => write!(f, "The {} route is not configured.", kind),
        }
    }
}

fn with_note(mut answer: Answer, note: impl fmt::Display) -> Answer {
    answer.text = if answer.text.trim().is_empty() {
        format!("Note: {}", note)
    } else {
        format!("{}\n\nNote: {}", answer.text, note)
    };
    answer
}

/// Confidence of two combined answers. Symmetric, and always between the two inputs.
pub fn combined_confidence(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum <= 0.0 {
        return 0.0;
    }
    // Rounding can land an ulp outside the inputs.
    ((a * a + b * b) / sum).clamp(a.min(b), a.max(b))
}

fn combine(doc: &Answer, graph: &Answer, cfg: &SynthesisConfig) -> Answer {
    let mut parts = Vec::with_capacity(3);
    if !doc.text.trim().is_empty() {
        parts.push(doc.text.clone());
    }
    if !graph.text.trim().is_empty() {
        parts.push(format!("Graph analysis: {}", graph.text));
    }
    let gap = (doc.confidence - graph.confidence).abs();
    if gap >= cfg.disagreement_threshold {
        parts.push(format!(
            "Note: the document and graph analyses diverge (confidence {:.2} vs {:.2}); \
             prefer the more confident one where they conflict.",
            doc.confidence, graph.confidence
        ));
    }

    let reasoning = match (&doc.reasoning, &graph.reasoning) {
        (Some(d), Some(g)) => Some(format!("Document: {} Graph: {}", d, g)),
        (Some(d), None) => Some(format!("Document: {}", d)),
        (None, Some(g)) => Some(format!("Graph: {}", g)),
        (None, None) => None,
    };

    Answer {
        text: parts.join("\n\n"),
        confidence: combined_confidence(doc.confidence, graph.confidence),
        sources: doc.sources.union(&graph.sources).cloned().collect(),
        reasoning,
    }
}

fn single(outcome: &BranchOutcome) -> Answer {
    match &outcome.result {
        BranchResult::Answered { answer } => answer.clone(),
        BranchResult::BudgetExceeded {
            salvaged: Some(answer),
            ..
        } if !(answer.sources.is_empty() && answer.confidence == 0.0) => {
            with_note(answer.clone(), Limitation(outcome))
        }
        _ => Answer::no_answer(Limitation(outcome).to_string()),
    }
}

/// Synthesize the final answer from every branch outcome of one call.
pub fn synthesize(outcomes: &[BranchOutcome], cfg: &SynthesisConfig) -> Answer {
    let mut sorted: Vec<&BranchOutcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| o.kind);

    match sorted.as_slice() {
        [] => Answer::no_answer("No route was run for this question."),
        [only] => single(only),
        [first, second, ..] => match (first.result.answer(), second.result.answer()) {
            (Some(a), Some(b)) => combine(a, b, cfg),
            (Some(a), None) => with_note(a.clone(), Limitation(second)),
            (None, Some(b)) => with_note(b.clone(), Limitation(first)),
            (None, None) => Answer::no_answer(format!(
                "{} {}",
                Limitation(first),
                Limitation(second)
            )),
        },
    }
}
