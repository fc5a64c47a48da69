//! Agent: a bounded decide/act loop
//!
//! An [`Agent`] is a configured participant: a kind (document or graph), a
//! decision service, a set of tools and advisory loop policies. Every call to
//! [`Agent::run`] creates a fresh [`AgentRun`] that owns its own [`Budget`].
//!
//! The loop is an explicit state machine:
//! - Deciding: ask the decision service for `CallTool` or `Finalize`
//! - Executing: reserve one budget slot, invoke the routed tool, record the call
//! - Terminal: `Finalized`, `BudgetExceeded`, `Failed` or `Cancelled`
//!
//! Decision calls and tool calls are the only suspension points. Both race the
//! run's [`CancellationToken`], so a cancelled run stops at its next suspension
//! point and reports `Cancelled`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::{util::BoxCloneService, BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::budgets::{Budget, BudgetExceeded};
use crate::config::{AgentConfig, EvidenceConfig};
use crate::error::{AgentsError, Result};
use crate::items::{AgentKind, Answer, ToolCall, ToolCallOutcome};
use crate::observability::{
    truncate_for_log, MetricsSink, ToolMetricsLayer, ToolTracingLayer, DEFAULT_QUESTION_LOG_CHARS,
};
use crate::provider::{
    Decided, DeciderSvc, Decision, DecisionContext, DecisionPurpose, MalformedDecision,
};
use crate::stores::is_source_id;
use crate::tool::{ToolDef, ToolError, ToolInvocation, ToolRouter, ToolSpec, ToolSvc, ToolTimeoutLayer};
use crate::usage::Usage;

/// Lifecycle status of an agent run. Set to a terminal value exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Finalized,
    BudgetExceeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One execution of an agent for one question.
#[derive(Debug)]
pub struct AgentRun {
    pub id: Uuid,
    pub agent: String,
    pub kind: AgentKind,
    pub question: String,
    pub budget: Budget,
    /// Ordered call log; `calls[i].sequence_index == i + 1`.
    ///
    /// A tool call cancelled mid-flight keeps its budget slot but is not
    /// logged, so on a `Cancelled` run `budget.used()` may be
    /// `calls.len() + 1`.
    pub calls: Vec<ToolCall>,
    pub status: RunStatus,
    pub result: Option<Answer>,
    /// Why the run failed, when it did
    pub failure: Option<String>,
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    fn start(agent: &str, kind: AgentKind, question: &str, limit: usize) -> Self {
        let budget = Budget::new(limit);
        budget.reset();
        Self {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            kind,
            question: question.to_string(),
            budget,
            calls: Vec::new(),
            status: RunStatus::Running,
            result: None,
            failure: None,
            usage: Usage::empty(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn answer(&self) -> Option<&Answer> {
        self.result.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.status == RunStatus::Finalized
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Snapshot published to monitors.
    pub fn progress(&self) -> RunProgress {
        RunProgress {
            run_id: self.id,
            agent: self.agent.clone(),
            status: self.status,
            calls: self.calls.clone(),
            used: self.budget.used(),
            limit: self.budget.limit(),
        }
    }

    fn terminate(&mut self, status: RunStatus) {
        debug_assert!(!self.status.is_terminal(), "terminal status set twice");
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Progress snapshot of a run, published after every recorded call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub agent: String,
    pub status: RunStatus,
    pub calls: Vec<ToolCall>,
    pub used: usize,
    pub limit: usize,
}

/// External control handed to a run by its supervisor.
#[derive(Debug)]
pub struct RunSignals {
    pub cancel: CancellationToken,
    pub progress: Option<watch::Sender<RunProgress>>,
}

impl RunSignals {
    pub fn new(cancel: CancellationToken, progress: watch::Sender<RunProgress>) -> Self {
        Self {
            cancel,
            progress: Some(progress),
        }
    }

    /// Signals nobody else observes: never cancelled, progress discarded.
    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Cancellation only, without a progress channel.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    fn publish(&self, run: &AgentRun) {
        if let Some(tx) = &self.progress {
            tx.send_replace(run.progress());
        }
    }

    /// Publish progress, then hand the task back to whoever is observing it.
    ///
    /// Monitors share the supervisor's task, so a decider or tool that
    /// answers without ever returning `Pending` would otherwise run the
    /// whole loop before any monitor sees a snapshot.
    async fn checkpoint(&self, run: &AgentRun) {
        self.publish(run);
        if self.progress.is_some() {
            tokio::task::yield_now().await;
        }
    }
}

// =============================
// Advisory loop policies
// =============================

/// Loop state visible to policies.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub steps: usize,
    pub used: usize,
    pub limit: usize,
    /// Distinct source ids across successful observations
    pub distinct_sources: usize,
    pub best_relevance: Option<f64>,
}

impl LoopState {
    fn observe(steps: usize, run: &AgentRun) -> Self {
        let mut sources = BTreeSet::new();
        let mut best: Option<f64> = None;
        for obs in run.calls.iter().filter_map(ToolCall::observation) {
            if obs.is_empty() {
                continue;
            }
            sources.extend(obs.sources.iter().cloned());
            if let Some(r) = obs.relevance {
                best = Some(best.map_or(r, |b| b.max(r)));
            }
        }
        Self {
            steps,
            used: run.budget.used(),
            limit: run.budget.limit(),
            distinct_sources: sources.len(),
            best_relevance: best,
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

/// Policy interface producing stop-early advice for the decision function.
/// Advice is never enforced by the loop.
pub trait AdvicePolicy: Send + Sync {
    fn advise(&self, state: &LoopState) -> Option<String>;
}

/// Function-backed policy for ergonomic composition.
#[derive(Clone)]
#[allow(clippy::type_complexity)]
pub struct PolicyFn(pub Arc<dyn Fn(&LoopState) -> Option<String> + Send + Sync + 'static>);

impl AdvicePolicy for PolicyFn {
    fn advise(&self, state: &LoopState) -> Option<String> {
        (self.0)(state)
    }
}

/// Composite policy: the first sub-policy with advice wins.
#[derive(Clone, Default)]
pub struct CompositePolicy {
    policies: Vec<PolicyFn>,
}

impl CompositePolicy {
    pub fn new(policies: Vec<PolicyFn>) -> Self {
        Self { policies }
    }

    pub fn push(&mut self, p: PolicyFn) {
        self.policies.push(p);
    }

    /// Last-call reminder first, then the evidence threshold.
    pub fn standard(evidence: &EvidenceConfig) -> Self {
        Self::new(vec![
            policies::last_call(),
            policies::evidence_threshold(evidence.clone()),
        ])
    }
}

impl AdvicePolicy for CompositePolicy {
    fn advise(&self, state: &LoopState) -> Option<String> {
        self.policies.iter().find_map(|p| p.advise(state))
    }
}

/// Built-in policies
pub mod policies {
    use super::*;

    /// Suggest finalizing once enough independent or highly relevant evidence exists.
    pub fn evidence_threshold(cfg: EvidenceConfig) -> PolicyFn {
        PolicyFn(Arc::new(move |s: &LoopState| {
            let enough_sources =
                cfg.min_independent_sources > 0 && s.distinct_sources >= cfg.min_independent_sources;
            let strong_hit = s.best_relevance.is_some_and(|r| r >= cfg.high_relevance);
            (enough_sources || strong_hit).then(|| {
                format!(
                    "Evidence threshold reached ({} independent sources, best relevance {}). \
                     Finalize now unless the evidence is clearly insufficient.",
                    s.distinct_sources,
                    s.best_relevance
                        .map_or_else(|| "n/a".to_string(), |r| format!("{:.2}", r))
                )
            })
        }))
    }

    /// Warn when at most one tool call remains.
    pub fn last_call() -> PolicyFn {
        PolicyFn(Arc::new(|s: &LoopState| match s.remaining() {
            0 if s.limit > 0 => {
                Some("No tool calls remain. Finalize with the evidence gathered so far.".to_string())
            }
            1 => Some("One tool call remains. Use it only if it is essential.".to_string()),
            _ => None,
        }))
    }
}

// =============================
// Agent and builder
// =============================

/// A configured agent. Cheap to clone; each run clones its services.
#[derive(Clone)]
pub struct Agent {
    kind: AgentKind,
    config: AgentConfig,
    decider: Arc<tokio::sync::Mutex<DeciderSvc>>,
    tools: Arc<tokio::sync::Mutex<ToolSvc>>,
    specs: Arc<Vec<ToolSpec>>,
    policy: CompositePolicy,
}

pub struct AgentBuilder {
    kind: AgentKind,
    config: AgentConfig,
    decider: Option<DeciderSvc>,
    tools: Vec<ToolDef>,
    policy: Option<CompositePolicy>,
    metrics: Option<MetricsSink>,
}

impl Agent {
    /// Builder with the preset configuration for `kind`.
    pub fn builder(kind: AgentKind) -> AgentBuilder {
        let config = match kind {
            AgentKind::Document => AgentConfig::document(),
            AgentKind::Graph => AgentConfig::graph(),
        };
        AgentBuilder {
            kind,
            config,
            decider: None,
            tools: Vec::new(),
            policy: None,
            metrics: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tool_specs(&self) -> &[ToolSpec] {
        &self.specs
    }
}

impl AgentBuilder {
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_tool_calls(mut self, n: usize) -> Self {
        self.config.max_tool_calls = n;
        self
    }

    pub fn tool_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.tool_timeout = Some(timeout);
        self
    }

    /// Decision service driving the loop (OpenAI, scripted, closure, ...).
    pub fn decider<D>(mut self, decider: D) -> Self
    where
        D: Service<DecisionContext, Response = Decided, Error = BoxError> + Clone + Send + 'static,
        D::Future: Send + 'static,
    {
        self.decider = Some(BoxCloneService::new(decider));
        self
    }

    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Replace the default advisory policies.
    pub fn policy(mut self, policy: CompositePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Report tool metrics to `collector`.
    pub fn metrics<C>(mut self, collector: C) -> Self
    where
        C: Service<crate::observability::MetricRecord, Response = (), Error = BoxError>
            + Clone
            + Send
            + 'static,
        C::Future: Send + 'static,
    {
        self.metrics = Some(BoxCloneService::new(collector));
        self
    }

    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;
        let decider = self.decider.ok_or_else(|| AgentsError::Config {
            message: format!("agent {} has no decision service", self.config.name),
        })?;

        let (router, specs) = ToolRouter::new(self.tools);
        let mut routed: ToolSvc = match self.config.tool_timeout {
            Some(t) => BoxCloneService::new(ToolTimeoutLayer::new(t).layer(router)),
            None => BoxCloneService::new(router),
        };
        if let Some(collector) = self.metrics {
            routed = BoxCloneService::new(ToolMetricsLayer::new(collector).layer(routed));
        }
        let traced = BoxCloneService::new(ToolTracingLayer::new(self.config.name.clone()).layer(routed));

        let policy = self
            .policy
            .unwrap_or_else(|| CompositePolicy::standard(&self.config.evidence));

        Ok(Agent {
            kind: self.kind,
            config: self.config,
            decider: Arc::new(tokio::sync::Mutex::new(decider)),
            tools: Arc::new(tokio::sync::Mutex::new(traced)),
            specs: Arc::new(specs),
            policy,
        })
    }
}

enum Step<T> {
    Done(T),
    Cancelled,
}

impl Agent {
    /// Run the loop to completion with no external supervision.
    pub async fn run(&self, question: &str) -> Result<AgentRun> {
        self.run_with(question, RunSignals::detached()).await
    }

    /// Run the loop under external cancellation and progress reporting.
    ///
    /// Ordinary failures end in a terminal status on the returned run. `Err`
    /// is reserved for a tool that broke its contract.
    #[instrument(
        name = "agent.run",
        skip_all,
        fields(agent = %self.config.name, kind = %self.kind, run_id = tracing::field::Empty)
    )]
    pub async fn run_with(&self, question: &str, signals: RunSignals) -> Result<AgentRun> {
        let mut run = AgentRun::start(&self.config.name, self.kind, question, self.config.max_tool_calls);
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        info!(
            question = %truncate_for_log(question, DEFAULT_QUESTION_LOG_CHARS),
            limit = run.budget.limit(),
            "agent run started"
        );
        signals.checkpoint(&run).await;

        let mut decider = self.decider.lock().await.clone();
        let mut tools = self.tools.lock().await.clone();
        let mut feedback: Option<String> = None;
        let mut retried_malformed = false;
        let mut steps = 0usize;

        loop {
            let state = LoopState::observe(steps, &run);
            let ctx = DecisionContext {
                purpose: DecisionPurpose::Act,
                agent: self.config.name.clone(),
                question: run.question.clone(),
                tools: self.specs.to_vec(),
                calls: run.calls.clone(),
                remaining_budget: state.remaining(),
                feedback: feedback.take(),
                advice: self.policy.advise(&state),
            };
            steps += 1;

            let decided = match race(&signals.cancel, async {
                decider.ready().await?.call(ctx).await
            })
            .await
            {
                Step::Done(res) => res,
                Step::Cancelled => return Ok(self.finish(run, RunStatus::Cancelled, None, None, &signals)),
            };

            let decided = match decided {
                Ok(d) => d,
                Err(e) => match e.downcast::<MalformedDecision>() {
                    Ok(malformed) => {
                        if retried_malformed {
                            let reason = format!("malformed output after retry: {}", malformed.reason);
                            return Ok(self.finish(run, RunStatus::Failed, None, Some(reason), &signals));
                        }
                        warn!(reason = %malformed.reason, "malformed decision, retrying once");
                        retried_malformed = true;
                        feedback = Some(malformed.reason);
                        continue;
                    }
                    Err(e) => {
                        let reason = format!("decision service error: {}", e);
                        return Ok(self.finish(run, RunStatus::Failed, None, Some(reason), &signals));
                    }
                },
            };
            run.usage += decided.usage;

            match decided.decision {
                Decision::CallTool { name, arguments } => {
                    let sequence_index = match run.budget.check_and_increment() {
                        Ok(n) => n,
                        Err(exceeded) => {
                            let salvaged = self.salvage(&run, exceeded);
                            return Ok(self.finish(
                                run,
                                RunStatus::BudgetExceeded,
                                Some(salvaged),
                                None,
                                &signals,
                            ));
                        }
                    };
                    debug!(tool = %name, sequence = sequence_index, "executing tool");
                    let invocation = ToolInvocation {
                        id: format!("{}-{}", run.id, sequence_index),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    };
                    let result = match race(&signals.cancel, async {
                        tools.ready().await?.call(invocation).await
                    })
                    .await
                    {
                        Step::Done(res) => res,
                        Step::Cancelled => {
                            return Ok(self.finish(run, RunStatus::Cancelled, None, None, &signals))
                        }
                    };
                    let outcome = match result {
                        Ok(obs) => ToolCallOutcome::Observation(obs),
                        Err(e) => match e.downcast::<ToolError>() {
                            Ok(te) => ToolCallOutcome::Error(*te),
                            Err(other) => {
                                let message = format!(
                                    "tool {} failed with an error that is not a ToolError: {}",
                                    name, other
                                );
                                self.finish(run, RunStatus::Failed, None, Some(message.clone()), &signals);
                                return Err(AgentsError::ContractViolation { message });
                            }
                        },
                    };
                    run.calls.push(ToolCall {
                        sequence_index,
                        tool_name: name,
                        arguments,
                        outcome,
                        timestamp: Utc::now(),
                    });
                    signals.checkpoint(&run).await;
                }
                Decision::Finalize(answer) => {
                    let answer = keep_source_ids(answer);
                    match answer.validate() {
                        Ok(()) => {
                            return Ok(self.finish(run, RunStatus::Finalized, Some(answer), None, &signals))
                        }
                        Err(reason) if !retried_malformed => {
                            warn!(%reason, "invalid final answer, retrying once");
                            retried_malformed = true;
                            feedback = Some(reason);
                        }
                        Err(reason) => {
                            let reason = format!("invalid final answer after retry: {}", reason);
                            return Ok(self.finish(run, RunStatus::Failed, None, Some(reason), &signals));
                        }
                    }
                }
                Decision::Route(_) => {
                    let reason = "a routing decision is not valid inside an agent run".to_string();
                    if retried_malformed {
                        let reason = format!("malformed output after retry: {}", reason);
                        return Ok(self.finish(run, RunStatus::Failed, None, Some(reason), &signals));
                    }
                    warn!(%reason, "malformed decision, retrying once");
                    retried_malformed = true;
                    feedback = Some(reason);
                }
            }
        }
    }

    /// Best answer available when the budget ran out before finalize.
    fn salvage(&self, run: &AgentRun, exceeded: BudgetExceeded) -> Answer {
        let evidence: Vec<_> = run
            .calls
            .iter()
            .filter_map(ToolCall::observation)
            .filter(|o| !o.is_empty())
            .collect();
        let reasoning = format!(
            "Truncated: the tool-call budget was exhausted ({} of {} calls) before the agent finalized.",
            exceeded.used, exceeded.limit
        );
        if evidence.is_empty() {
            return Answer::no_answer(reasoning);
        }
        let sources: BTreeSet<String> = evidence
            .iter()
            .flat_map(|o| o.sources.iter().cloned())
            .collect();
        Answer::new(
            format!(
                "The tool-call limit was reached before a final answer was produced. \
                 Partial evidence from {} observation(s) is listed in the sources.",
                evidence.len()
            ),
            self.config.limit_reached_confidence,
        )
        .with_sources(sources)
        .with_reasoning(reasoning)
    }

    fn finish(
        &self,
        mut run: AgentRun,
        status: RunStatus,
        result: Option<Answer>,
        failure: Option<String>,
        signals: &RunSignals,
    ) -> AgentRun {
        run.terminate(status);
        run.result = result;
        run.failure = failure;
        signals.publish(&run);
        match status {
            RunStatus::Failed => warn!(
                status = ?status,
                calls = run.calls.len(),
                reason = run.failure.as_deref().unwrap_or_default(),
                "agent run failed"
            ),
            _ => info!(
                status = ?status,
                calls = run.calls.len(),
                confidence = run.result.as_ref().map(|a| a.confidence),
                "agent run finished"
            ),
        }
        run
    }
}

/// Await `fut` unless `cancel` fires first. Cancellation is checked first.
/// Drop cited sources that are not `question_<n>` or `node_<n>` ids.
fn keep_source_ids(mut answer: Answer) -> Answer {
    let cited = answer.sources.len();
    answer.sources.retain(|s| is_source_id(s));
    if answer.sources.len() < cited {
        debug!(dropped = cited - answer.sources.len(), "dropped invalid source ids");
    }
    answer
}

async fn race<F: std::future::Future>(cancel: &CancellationToken, fut: F) -> Step<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Step::Cancelled,
        out = fut => Step::Done(out),
    }
}
