//! Budgets: a hard cap on tool invocations for one agent run
//!
//! A `Budget` belongs to exactly one `AgentRun`. The agent creates it when the
//! run starts, calls `reset` once, and drops it together with the run. It is
//! never cloned, never stored in a static, and never handed to a second run.
//!
//! `check_and_increment` is the only mutator. It is a single atomic
//! read-modify-write, so even an accidentally shared instance can never be
//! pushed past its limit and never applies a partial increment.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signal produced when a run asks for one more tool call than its budget allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Tool-call budget exceeded: {used} of {limit} used")]
pub struct BudgetExceeded {
    pub limit: usize,
    pub used: usize,
}

/// Per-run tool-call counter.
#[derive(Debug)]
pub struct Budget {
    limit: usize,
    used: AtomicUsize,
}

impl Budget {
    /// Create a budget allowing `limit` tool calls.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.limit
    }

    /// Reserve one tool call.
    ///
    /// Returns the 1-based sequence number of the granted call, or
    /// `BudgetExceeded` without touching the counter.
    pub fn check_and_increment(&self) -> Result<usize, BudgetExceeded> {
        let limit = self.limit;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < limit).then_some(used + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|used| BudgetExceeded { limit, used })
    }

    /// Return the budget to zero use. Only called when a run starts.
    pub fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
    }
}
