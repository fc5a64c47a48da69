//! # Guardrails (orientation)
//!
//! A guardrail is a [`Monitor`] that runs alongside one agent run and may trip
//! with a [`GuardrailViolation`]. The [`GuardrailSupervisor`] races the agent
//! against its monitors:
//!
//! - agent finishes first: the remaining monitors are dropped and the run is returned
//! - a monitor trips first: the run's token is cancelled, the other monitors are
//!   dropped, the agent is awaited until it has actually stopped (it reports
//!   `Cancelled`), then the violation is raised as
//!   [`AgentsError::GuardrailTripped`](crate::error::AgentsError::GuardrailTripped)
//!
//! Monitors are polled on the supervisor's own task in registration order.
//! When several monitors trip in the same poll round the earliest registered
//! one is reported; the rest are discarded.

use std::future::Future;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agent::{Agent, AgentRun, RunProgress, RunSignals};
use crate::error::Result;
use crate::stores::find_write_clause;

/// Raised by a monitor to abort the supervised run. Never retried.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{monitor_name}: {reason}")]
pub struct GuardrailViolation {
    pub monitor_name: String,
    pub reason: String,
    pub tripped_at: DateTime<Utc>,
}

impl GuardrailViolation {
    pub fn new(monitor_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            monitor_name: monitor_name.into(),
            reason: reason.into(),
            tripped_at: Utc::now(),
        }
    }
}

/// A tripped guardrail together with the cancelled run it aborted.
#[derive(Debug)]
pub struct GuardrailTrip {
    pub violation: GuardrailViolation,
    /// The guardrail aborts the whole orchestrated call, not just this branch
    pub fatal: bool,
    pub run: AgentRun,
}

/// What a monitor can observe of the run it watches.
pub struct MonitorContext {
    pub question: String,
    progress: watch::Receiver<RunProgress>,
}

impl MonitorContext {
    pub fn new(question: impl Into<String>, progress: watch::Receiver<RunProgress>) -> Self {
        Self {
            question: question.into(),
            progress,
        }
    }

    /// Wait for the next progress snapshot. `None` once the run has stopped publishing.
    pub async fn next(&mut self) -> Option<RunProgress> {
        self.progress.changed().await.ok()?;
        Some(self.progress.borrow_and_update().clone())
    }

    /// The latest snapshot without waiting.
    pub fn current(&self) -> RunProgress {
        self.progress.borrow().clone()
    }
}

/// An independent routine that may abort an agent run.
///
/// `watch` returns `Ok(())` when the monitor has nothing more to check and
/// `Err` to trip. It may also run until the supervisor drops it.
#[async_trait]
pub trait Monitor: Send + Sync {
    fn name(&self) -> &str;
    async fn watch(&self, ctx: MonitorContext) -> std::result::Result<(), GuardrailViolation>;
}

/// A monitor plus the scope of its trip.
#[derive(Clone)]
pub struct Guardrail {
    pub monitor: Arc<dyn Monitor>,
    pub fatal: bool,
}

impl Guardrail {
    /// Trip aborts only the supervised branch.
    pub fn branch(monitor: impl Monitor + 'static) -> Self {
        Self {
            monitor: Arc::new(monitor),
            fatal: false,
        }
    }

    /// Trip aborts the whole orchestrated call.
    pub fn fatal(monitor: impl Monitor + 'static) -> Self {
        Self {
            monitor: Arc::new(monitor),
            fatal: true,
        }
    }

    pub fn name(&self) -> &str {
        self.monitor.name()
    }
}

impl std::fmt::Debug for Guardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guardrail")
            .field("monitor", &self.monitor.name())
            .field("fatal", &self.fatal)
            .finish()
    }
}

type MonitorFuture = BoxFuture<'static, std::result::Result<(), GuardrailViolation>>;

/// Running monitors of one supervised run, in registration order.
struct MonitorSet {
    running: Vec<(bool, MonitorFuture)>,
}

impl MonitorSet {
    fn start(guardrails: &[Guardrail], question: &str, rx: &watch::Receiver<RunProgress>) -> Self {
        let running = guardrails
            .iter()
            .map(|g| {
                let monitor = g.monitor.clone();
                let ctx = MonitorContext::new(question, rx.clone());
                let fut: MonitorFuture = Box::pin(async move { monitor.watch(ctx).await });
                (g.fatal, fut)
            })
            .collect();
        Self { running }
    }

    /// Resolves with the first violation; pending forever once every monitor
    /// has finished cleanly.
    fn next_trip(&mut self) -> impl Future<Output = (GuardrailViolation, bool)> + '_ {
        std::future::poll_fn(move |cx| {
            let mut i = 0;
            while i < self.running.len() {
                let (fatal, fut) = &mut self.running[i];
                match fut.as_mut().poll(cx) {
                    Poll::Ready(Err(violation)) => return Poll::Ready((violation, *fatal)),
                    Poll::Ready(Ok(())) => {
                        // keep registration order for the survivors
                        drop(self.running.remove(i));
                    }
                    Poll::Pending => i += 1,
                }
            }
            Poll::Pending
        })
    }

    /// Stop every monitor. They live on the supervisor's task, so dropping
    /// them is their termination.
    fn stop(&mut self) {
        self.running.clear();
    }
}

/// Runs one agent concurrently with its monitors.
#[derive(Debug, Clone, Default)]
pub struct GuardrailSupervisor {
    guardrails: Vec<Guardrail>,
}

impl GuardrailSupervisor {
    pub fn new(guardrails: Vec<Guardrail>) -> Self {
        Self { guardrails }
    }

    pub fn guardrails(&self) -> &[Guardrail] {
        &self.guardrails
    }

    /// Supervise `agent` answering `question`.
    pub async fn supervise_agent(
        &self,
        agent: &Agent,
        question: &str,
        parent: &CancellationToken,
    ) -> Result<AgentRun> {
        self.supervise(question, parent, |signals| agent.run_with(question, signals))
            .await
    }

    /// Race the run produced by `start` against the monitors.
    ///
    /// The run receives a child of `parent`, so cancelling `parent` stops it
    /// too; that case is an ordinary `Cancelled` run, not a violation.
    #[instrument(name = "guardrail.supervise", skip_all, fields(monitors = self.guardrails.len()))]
    pub async fn supervise<F, Fut>(
        &self,
        question: &str,
        parent: &CancellationToken,
        start: F,
    ) -> Result<AgentRun>
    where
        F: FnOnce(RunSignals) -> Fut,
        Fut: Future<Output = Result<AgentRun>>,
    {
        let cancel = parent.child_token();
        if self.guardrails.is_empty() {
            return start(RunSignals::with_cancel(cancel)).await;
        }

        let (tx, rx) = watch::channel(RunProgress::default());
        let mut monitors = MonitorSet::start(&self.guardrails, question, &rx);
        drop(rx);
        let agent = start(RunSignals::new(cancel.clone(), tx));
        tokio::pin!(agent);

        let (violation, fatal) = tokio::select! {
            biased;
            trip = monitors.next_trip() => trip,
            finished = &mut agent => {
                monitors.stop();
                debug!("agent finished before any monitor tripped");
                return finished;
            }
        };

        warn!(
            monitor = %violation.monitor_name,
            reason = %violation.reason,
            fatal,
            "guardrail tripped, cancelling run"
        );
        cancel.cancel();
        monitors.stop();
        // Wait until the run has actually unwound.
        let run = agent.await?;
        Err(GuardrailTrip {
            violation,
            fatal,
            run,
        }
        .into())
    }
}

// =============================
// Built-in monitors
// =============================

/// Trips when the question is longer than `max_chars` characters.
#[derive(Debug, Clone)]
pub struct MaxQuestionLength {
    name: String,
    max_chars: usize,
}

impl MaxQuestionLength {
    pub fn new(max_chars: usize) -> Self {
        Self {
            name: format!("MaxQuestionLength_{}", max_chars),
            max_chars,
        }
    }
}

#[async_trait]
impl Monitor for MaxQuestionLength {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self, ctx: MonitorContext) -> std::result::Result<(), GuardrailViolation> {
        let len = ctx.question.chars().count();
        if len > self.max_chars {
            return Err(GuardrailViolation::new(
                &self.name,
                format!(
                    "question exceeds maximum length of {} characters ({})",
                    self.max_chars, len
                ),
            ));
        }
        Ok(())
    }
}

/// Trips when the question or any tool argument contains a blocked pattern.
/// Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct BlockedPatterns {
    name: String,
    patterns: Vec<String>,
}

impl BlockedPatterns {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    fn find(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.patterns
            .iter()
            .find(|p| lower.contains(p.as_str()))
            .map(String::as_str)
    }
}

#[async_trait]
impl Monitor for BlockedPatterns {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self, mut ctx: MonitorContext) -> std::result::Result<(), GuardrailViolation> {
        if let Some(p) = self.find(&ctx.question) {
            return Err(GuardrailViolation::new(
                &self.name,
                format!("question contains blocked pattern: {}", p),
            ));
        }
        while let Some(progress) = ctx.next().await {
            for call in &progress.calls {
                if let Some(p) = self.find(&call.arguments.to_string()) {
                    return Err(GuardrailViolation::new(
                        &self.name,
                        format!(
                            "arguments of {} call #{} contain blocked pattern: {}",
                            call.tool_name, call.sequence_index, p
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Trips as soon as a tool is asked to run a graph query with a write clause.
#[derive(Debug, Clone)]
pub struct ReadOnlyGraphQueries {
    name: String,
    argument: String,
}

impl ReadOnlyGraphQueries {
    /// Inspect the `query` argument of every call.
    pub fn new() -> Self {
        Self::on_argument("query")
    }

    pub fn on_argument(argument: impl Into<String>) -> Self {
        Self {
            name: "ReadOnlyGraphQueries".to_string(),
            argument: argument.into(),
        }
    }
}

impl Default for ReadOnlyGraphQueries {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Monitor for ReadOnlyGraphQueries {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self, mut ctx: MonitorContext) -> std::result::Result<(), GuardrailViolation> {
        while let Some(progress) = ctx.next().await {
            for call in &progress.calls {
                let Some(query) = call.arguments.get(&self.argument).and_then(|v| v.as_str()) else {
                    continue;
                };
                if let Some(clause) = find_write_clause(query) {
                    return Err(GuardrailViolation::new(
                        &self.name,
                        format!(
                            "{} call #{} attempted a write clause: {}",
                            call.tool_name, call.sequence_index, clause
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Trips after `max_consecutive` tool errors in a row.
#[derive(Debug, Clone)]
pub struct ToolErrorStreak {
    name: String,
    max_consecutive: usize,
}

impl ToolErrorStreak {
    pub fn new(max_consecutive: usize) -> Self {
        Self {
            name: format!("ToolErrorStreak_{}", max_consecutive),
            max_consecutive: max_consecutive.max(1),
        }
    }
}

#[async_trait]
impl Monitor for ToolErrorStreak {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self, mut ctx: MonitorContext) -> std::result::Result<(), GuardrailViolation> {
        while let Some(progress) = ctx.next().await {
            let streak = progress
                .calls
                .iter()
                .rev()
                .take_while(|c| c.is_error())
                .count();
            if streak >= self.max_consecutive {
                let last = progress
                    .calls
                    .last()
                    .and_then(|c| c.error())
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                return Err(GuardrailViolation::new(
                    &self.name,
                    format!("{} consecutive tool errors, last: {}", streak, last),
                ));
            }
        }
        Ok(())
    }
}

/// Monitor evaluating a closure on every progress snapshot.
#[derive(Clone)]
pub struct FnMonitor {
    name: String,
    #[allow(clippy::type_complexity)]
    check: Arc<dyn Fn(&RunProgress) -> Option<String> + Send + Sync>,
}

/// Build a monitor from a closure returning a trip reason.
pub fn monitor_fn<F>(name: impl Into<String>, check: F) -> FnMonitor
where
    F: Fn(&RunProgress) -> Option<String> + Send + Sync + 'static,
{
    FnMonitor {
        name: name.into(),
        check: Arc::new(check),
    }
}

#[async_trait]
impl Monitor for FnMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self, mut ctx: MonitorContext) -> std::result::Result<(), GuardrailViolation> {
        while let Some(progress) = ctx.next().await {
            if let Some(reason) = (self.check)(&progress) {
                return Err(GuardrailViolation::new(&self.name, reason));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{ToolCall, ToolCallOutcome};
    use crate::tool::{Observation, ToolError};
    use serde_json::{json, Value};

    fn call(seq: usize, arguments: Value, error: bool) -> ToolCall {
        ToolCall {
            sequence_index: seq,
            tool_name: "query_graph".into(),
            arguments,
            outcome: if error {
                ToolCallOutcome::Error(ToolError::retryable("store unavailable"))
            } else {
                ToolCallOutcome::Observation(Observation::new(json!([1])))
            },
            timestamp: Utc::now(),
        }
    }

    fn channel(question: &str) -> (watch::Sender<RunProgress>, MonitorContext) {
        let (tx, rx) = watch::channel(RunProgress::default());
        (tx, MonitorContext::new(question, rx))
    }

    fn publish(tx: &watch::Sender<RunProgress>, calls: Vec<ToolCall>) {
        tx.send_replace(RunProgress {
            used: calls.len(),
            limit: 5,
            calls,
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn max_question_length() {
        let (_tx, ctx) = channel("short");
        assert!(MaxQuestionLength::new(10).watch(ctx).await.is_ok());

        let (_tx, ctx) = channel("this question is far too long");
        let v = MaxQuestionLength::new(10).watch(ctx).await.unwrap_err();
        assert_eq!(v.monitor_name, "MaxQuestionLength_10");
        assert!(v.reason.contains("exceeds maximum length"));
    }

    #[tokio::test]
    async fn blocked_patterns_check_question_and_arguments() {
        let monitor = BlockedPatterns::new("Filter", vec!["Password".into()]);
        let (_tx, ctx) = channel("what is the admin PASSWORD");
        assert!(monitor.watch(ctx).await.is_err());

        let (tx, ctx) = channel("clean question");
        publish(&tx, vec![call(1, json!({"query": "password reset"}), false)]);
        let v = monitor.watch(ctx).await.unwrap_err();
        assert!(v.reason.contains("call #1"));
    }

    #[tokio::test]
    async fn read_only_queries() {
        let monitor = ReadOnlyGraphQueries::new();
        let (tx, ctx) = channel("q");
        publish(
            &tx,
            vec![
                call(1, json!({"query": "MATCH (n) RETURN n"}), false),
                call(2, json!({"query": "MATCH (n) DETACH DELETE n"}), false),
            ],
        );
        let v = monitor.watch(ctx).await.unwrap_err();
        assert!(v.reason.contains("DELETE"));
        assert!(v.reason.contains("#2"));
    }

    #[tokio::test]
    async fn monitors_finish_when_run_stops_publishing() {
        let (tx, ctx) = channel("q");
        publish(&tx, vec![call(1, json!({}), true)]);
        drop(tx);
        assert!(ToolErrorStreak::new(2).watch(ctx).await.is_ok());
    }

    #[tokio::test]
    async fn error_streak_trips() {
        let (tx, ctx) = channel("q");
        publish(
            &tx,
            vec![
                call(1, json!({}), true),
                call(2, json!({}), false),
                call(3, json!({}), true),
                call(4, json!({}), true),
            ],
        );
        let v = ToolErrorStreak::new(2).watch(ctx).await.unwrap_err();
        assert!(v.reason.starts_with("2 consecutive"));
        assert!(v.reason.contains("store unavailable"));
    }

    #[tokio::test]
    async fn fn_monitor_sees_progress() {
        let monitor = monitor_fn("TooManyCalls", |p: &RunProgress| {
            (p.used >= 3).then(|| format!("{} calls used", p.used))
        });
        let (tx, ctx) = channel("q");
        publish(&tx, (1..=3).map(|i| call(i, json!({}), false)).collect());
        let v = monitor.watch(ctx).await.unwrap_err();
        assert_eq!(v.reason, "3 calls used");
        assert_eq!(v.to_string(), "TooManyCalls: 3 calls used");
    }

    #[tokio::test]
    async fn first_registered_monitor_wins_a_tie() {
        let guardrails = vec![
            Guardrail::branch(MaxQuestionLength::new(1)),
            Guardrail::fatal(BlockedPatterns::new("Filter", vec!["question".into()])),
        ];
        let (_tx, rx) = watch::channel(RunProgress::default());
        let mut set = MonitorSet::start(&guardrails, "a question", &rx);
        let (violation, fatal) = set.next_trip().await;
        assert_eq!(violation.monitor_name, "MaxQuestionLength_1");
        assert!(!fatal);
    }
}
