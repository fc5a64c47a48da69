//! Routed question answering
//!
//! What this module provides
//! - One entry point, [`Orchestrator::answer`], that turns a question into a
//!   single [`Answer`] and absorbs every ordinary failure into it
//!
//! Exports
//! - Models
//!   - `Route`, `RoutingDecision`, `RouteRequest`, `Routed`
//!   - `OrchestratorReport`, `BranchOutcome`, `BranchResult`
//! - Services
//!   - `QuestionRouter: Service<RouteRequest, Response = Routed>`
//!   - `KeywordRouter`, `DecisionRouter`, `FixedRouter`, `router_fn`
//! - Utils
//!   - `OrchestratorBuilder`
//!   - `synthesis::synthesize`
//!
//! Composition
//! - `Orchestrator::builder().router(r).document_agent(a).graph_agent(b).build()?`
//! - each routed branch runs under a [`GuardrailSupervisor`]; `Both` runs the two
//!   branches concurrently on the caller's task with independent budgets
//! - the whole branch phase is bounded by a deadline; on expiry the call token is
//!   cancelled and every branch is awaited before synthesis
//!
//! Testing strategy
//! - scripted deciders and in-memory stores drive both agents
//! - a paused tokio clock makes deadline tests deterministic

pub mod synthesis;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::{util::BoxCloneService, BoxError, Service, ServiceExt};
use tracing::{debug, info, instrument, warn};

use crate::agent::Agent;
use crate::config::OrchestratorConfig;
use crate::error::{AgentsError, Result};
use crate::guardrail::{Guardrail, GuardrailSupervisor};
use crate::items::{AgentKind, Answer};
use crate::observability::truncate_for_log;
use crate::provider::{DeciderSvc, Decision, DecisionContext, DecisionService};
use crate::stores::{
    document_search_tool, graph_query_tool, graph_schema_tool, DocumentStore, GraphStore,
};
use crate::usage::{Usage, UsageStats};

pub use synthesis::{synthesize, BranchOutcome, BranchResult};

/// Which agent kind(s) answer a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    DocumentOnly,
    GraphOnly,
    Both,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::DocumentOnly => "document_only",
            Route::GraphOnly => "graph_only",
            Route::Both => "both",
        }
    }

    /// Agent kinds this route runs, in synthesis order.
    pub fn kinds(&self) -> &'static [AgentKind] {
        match self {
            Route::DocumentOnly => &[AgentKind::Document],
            Route::GraphOnly => &[AgentKind::Graph],
            Route::Both => &[AgentKind::Document, AgentKind::Graph],
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = AgentsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document_only" | "document" | "documents" => Ok(Route::DocumentOnly),
            "graph_only" | "graph" => Ok(Route::GraphOnly),
            "both" => Ok(Route::Both),
            other => Err(AgentsError::Config {
                message: format!(
                    "unknown route '{}', expected document_only, graph_only or both",
                    other
                ),
            }),
        }
    }
}

/// A route plus the reason it was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingDecision {
    pub route: Route,
    /// Why this route was chosen
    #[serde(default)]
    pub rationale: String,
}

impl RoutingDecision {
    pub fn new(route: Route, rationale: impl Into<String>) -> Self {
        Self {
            route,
            rationale: rationale.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub question: String,
}

/// Router response: the decision and what producing it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub decision: RoutingDecision,
    pub usage: Usage,
}

impl From<RoutingDecision> for Routed {
    fn from(decision: RoutingDecision) -> Self {
        Self {
            decision,
            usage: Usage::empty(),
        }
    }
}

pub trait QuestionRouter: Service<RouteRequest, Response = Routed, Error = BoxError> {}
impl<T> QuestionRouter for T where T: Service<RouteRequest, Response = Routed, Error = BoxError> {}

pub type RouterSvc = BoxCloneService<RouteRequest, Routed, BoxError>;

/// Router from an async closure.
pub fn router_fn<F, Fut>(f: F) -> RouterSvc
where
    F: Fn(RouteRequest) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = std::result::Result<RoutingDecision, BoxError>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(move |req: RouteRequest| {
        let f = f.clone();
        async move { f(req).await.map(Routed::from) }
    }))
}

/// Always picks the same route.
#[derive(Debug, Clone, Copy)]
pub struct FixedRouter {
    route: Route,
}

impl FixedRouter {
    pub fn new(route: Route) -> Self {
        Self { route }
    }
}

impl Service<RouteRequest> for FixedRouter {
    type Response = Routed;
    type Error = BoxError;
    type Future = std::future::Ready<std::result::Result<Routed, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: RouteRequest) -> Self::Future {
        std::future::ready(Ok(Routed::from(RoutingDecision::new(
            self.route,
            "fixed route",
        ))))
    }
}

const GRAPH_CUES: &[&str] = &[
    "correlat",
    "relationship",
    "pattern",
    "lead to",
    "leads to",
    "connection",
    "connected",
    "trend",
    "sequence",
    "how often",
];

const DOCUMENT_CUES: &[&str] = &[
    "example",
    "what do users say",
    "what users say",
    "discussion",
    "case stud",
    "experience",
    "quote",
];

/// Cue-word router. Questions about relationships and patterns go to the
/// graph, requests for examples go to documents, both kinds of cue select
/// `Both`, and anything else defaults to document search.
#[derive(Debug, Clone)]
pub struct KeywordRouter {
    document_cues: Arc<Vec<String>>,
    graph_cues: Arc<Vec<String>>,
}

impl Default for KeywordRouter {
    fn default() -> Self {
        Self::new(
            DOCUMENT_CUES.iter().map(|s| s.to_string()).collect(),
            GRAPH_CUES.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl KeywordRouter {
    /// Cues are matched case-insensitively as substrings.
    pub fn new(document_cues: Vec<String>, graph_cues: Vec<String>) -> Self {
        let lower = |cues: Vec<String>| -> Vec<String> {
            cues.into_iter().map(|c| c.to_lowercase()).collect()
        };
        Self {
            document_cues: Arc::new(lower(document_cues)),
            graph_cues: Arc::new(lower(graph_cues)),
        }
    }

    pub fn classify(&self, question: &str) -> RoutingDecision {
        let q = question.to_lowercase();
        let hits = |cues: &[String]| -> Vec<String> {
            cues.iter().filter(|c| q.contains(c.as_str())).cloned().collect()
        };
        let doc = hits(self.document_cues.as_slice());
        let graph = hits(self.graph_cues.as_slice());

        match (doc.is_empty(), graph.is_empty()) {
            (false, false) => RoutingDecision::new(
                Route::Both,
                format!(
                    "document cues [{}] and graph cues [{}]",
                    doc.join(", "),
                    graph.join(", ")
                ),
            ),
            (true, false) => {
                RoutingDecision::new(Route::GraphOnly, format!("graph cues [{}]", graph.join(", ")))
            }
            (false, true) => RoutingDecision::new(
                Route::DocumentOnly,
                format!("document cues [{}]", doc.join(", ")),
            ),
            (true, true) => {
                RoutingDecision::new(Route::DocumentOnly, "no routing cues, defaulting to document search")
            }
        }
    }
}

impl Service<RouteRequest> for KeywordRouter {
    type Response = Routed;
    type Error = BoxError;
    type Future = std::future::Ready<std::result::Result<Routed, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RouteRequest) -> Self::Future {
        std::future::ready(Ok(Routed::from(self.classify(&req.question))))
    }
}

/// Routes by asking the decision service with a routing context.
#[derive(Clone)]
pub struct DecisionRouter {
    decider: DeciderSvc,
}

impl DecisionRouter {
    pub fn new<D>(decider: D) -> Self
    where
        D: DecisionService + Clone + Send + 'static,
        D::Future: Send + 'static,
    {
        Self {
            decider: BoxCloneService::new(decider),
        }
    }
}

impl Service<RouteRequest> for DecisionRouter {
    type Response = Routed;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Routed, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RouteRequest) -> Self::Future {
        let mut decider = self.decider.clone();
        Box::pin(async move {
            let decided = decider
                .ready()
                .await?
                .call(DecisionContext::routing(req.question))
                .await
                .map_err(|e| AgentsError::Decision(e.to_string()))?;
            match decided.decision {
                Decision::Route(decision) => Ok(Routed {
                    decision,
                    usage: decided.usage,
                }),
                other => Err(AgentsError::Decision(format!(
                    "expected a routing decision, got {:?}",
                    other
                ))
                .into()),
            }
        })
    }
}

// =============================
// Orchestrator
// =============================

/// Everything one orchestrated call produced.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorReport {
    pub answer: Answer,
    pub routing: RoutingDecision,
    /// Routing failed and `fallback_route` was used
    pub routing_fallback: bool,
    /// One outcome per routed branch, in kind order
    pub branches: Vec<BranchOutcome>,
    pub timed_out: bool,
    pub usage: UsageStats,
    pub elapsed: Duration,
}

impl OrchestratorReport {
    pub fn branch(&self, kind: AgentKind) -> Option<&BranchOutcome> {
        self.branches.iter().find(|b| b.kind == kind)
    }

    pub fn tool_calls(&self) -> usize {
        self.branches.iter().map(|b| b.tool_calls).sum()
    }
}

/// Routes questions to the document and graph agents and synthesizes one answer.
#[derive(Clone)]
pub struct Orchestrator {
    router: Arc<tokio::sync::Mutex<RouterSvc>>,
    document: Option<Agent>,
    graph: Option<Agent>,
    guardrails: Vec<Guardrail>,
    config: OrchestratorConfig,
}

type StoreParts<S> = (DeciderSvc, Arc<S>);

pub struct OrchestratorBuilder {
    router: Option<RouterSvc>,
    document: Option<Agent>,
    graph: Option<Agent>,
    document_parts: Option<StoreParts<dyn DocumentStore>>,
    graph_parts: Option<StoreParts<dyn GraphStore>>,
    guardrails: Vec<Guardrail>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder {
            router: None,
            document: None,
            graph: None,
            document_parts: None,
            graph_parts: None,
            guardrails: Vec::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn agent(&self, kind: AgentKind) -> Option<&Agent> {
        match kind {
            AgentKind::Document => self.document.as_ref(),
            AgentKind::Graph => self.graph.as_ref(),
        }
    }
}

impl OrchestratorBuilder {
    pub fn router<R>(mut self, router: R) -> Self
    where
        R: QuestionRouter + Clone + Send + 'static,
        R::Future: Send + 'static,
    {
        self.router = Some(BoxCloneService::new(router));
        self
    }

    pub fn document_agent(mut self, agent: Agent) -> Self {
        self.document = Some(agent);
        self
    }

    pub fn graph_agent(mut self, agent: Agent) -> Self {
        self.graph = Some(agent);
        self
    }

    /// Build the document agent at `build()` from `config.document`, the
    /// search tool over `store` and `decider`.
    pub fn document_store<D>(mut self, decider: D, store: Arc<dyn DocumentStore>) -> Self
    where
        D: DecisionService + Clone + Send + 'static,
        D::Future: Send + 'static,
    {
        self.document_parts = Some((BoxCloneService::new(decider), store));
        self
    }

    /// Build the graph agent at `build()` from `config.graph`, the read-only
    /// query tool over `store` and `decider`.
    pub fn graph_store<D>(mut self, decider: D, store: Arc<dyn GraphStore>) -> Self
    where
        D: DecisionService + Clone + Send + 'static,
        D::Future: Send + 'static,
    {
        self.graph_parts = Some((BoxCloneService::new(decider), store));
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Guardrail applied to every branch of every call.
    pub fn guardrail(mut self, guardrail: Guardrail) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let config = self.config;

        let document = match (self.document, self.document_parts) {
            (Some(agent), _) => Some(agent),
            (None, Some((decider, store))) => Some(
                Agent::builder(AgentKind::Document)
                    .config(config.document.clone())
                    .decider(decider)
                    .tool(document_search_tool(store, config.stores.clone()))
                    .build()?,
            ),
            (None, None) => None,
        };
        let graph = match (self.graph, self.graph_parts) {
            (Some(agent), _) => Some(agent),
            (None, Some((decider, store))) => Some(
                Agent::builder(AgentKind::Graph)
                    .config(config.graph.clone())
                    .decider(decider)
                    .tool(graph_schema_tool(store.clone(), config.stores.clone()))
                    .tool(graph_query_tool(store, config.stores.clone()))
                    .build()?,
            ),
            (None, None) => None,
        };
        if document.is_none() && graph.is_none() {
            return Err(AgentsError::Config {
                message: "orchestrator needs at least one agent".to_string(),
            });
        }

        let router = self
            .router
            .unwrap_or_else(|| BoxCloneService::new(KeywordRouter::default()));

        Ok(Orchestrator {
            router: Arc::new(tokio::sync::Mutex::new(router)),
            document,
            graph,
            guardrails: self.guardrails,
            config,
        })
    }
}

impl Orchestrator {
    /// Answer with the configured guardrails and deadline.
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        self.answer(question, &[], self.config.timeout).await
    }

    /// Answer `question`, supervising every branch with the configured
    /// guardrails plus `guardrails`, and bounding the branches by `timeout`.
    ///
    /// Budget exhaustion, failed runs, branch-scoped guardrail trips and the
    /// deadline all end up in the returned answer. `Err` means a fatal
    /// guardrail tripped or a collaborator broke its contract.
    pub async fn answer(
        &self,
        question: &str,
        guardrails: &[Guardrail],
        timeout: Duration,
    ) -> Result<Answer> {
        self.answer_with_report(question, guardrails, timeout)
            .await
            .map(|report| report.answer)
    }

    /// Like [`Orchestrator::answer`], returning the full report.
    #[instrument(
        name = "orchestrator.answer",
        skip_all,
        fields(
            question = %truncate_for_log(question, self.config.question_log_chars),
            route = tracing::field::Empty,
        )
    )]
    pub async fn answer_with_report(
        &self,
        question: &str,
        guardrails: &[Guardrail],
        timeout: Duration,
    ) -> Result<OrchestratorReport> {
        let started = Instant::now();
        let mut usage = UsageStats::new();

        let (routing, routing_fallback, routing_usage) = self.route(question).await;
        usage.record("router", routing_usage);
        tracing::Span::current().record("route", routing.route.as_str());
        info!(route = %routing.route, rationale = %routing.rationale, "routed question");

        let supervisor = GuardrailSupervisor::new(
            self.guardrails.iter().chain(guardrails).cloned().collect(),
        );
        let cancel = CancellationToken::new();

        let route = routing.route;
        let work = async {
            match route {
                Route::DocumentOnly => {
                    vec![self.run_branch(AgentKind::Document, question, &supervisor, &cancel).await]
                }
                Route::GraphOnly => {
                    vec![self.run_branch(AgentKind::Graph, question, &supervisor, &cancel).await]
                }
                Route::Both => {
                    let (doc, graph) = tokio::join!(
                        self.run_branch(AgentKind::Document, question, &supervisor, &cancel),
                        self.run_branch(AgentKind::Graph, question, &supervisor, &cancel),
                    );
                    vec![doc, graph]
                }
            }
        };
        tokio::pin!(work);

        let mut timed_out = false;
        let results = tokio::select! {
            biased;
            results = &mut work => results,
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                warn!(timeout_ms = timeout.as_millis() as u64, "deadline reached, cancelling branches");
                cancel.cancel();
                // Branches stop at their next suspension point.
                work.await
            }
        };

        let mut branches = Vec::with_capacity(results.len());
        let mut fatal = None;
        for result in results {
            match result {
                Ok(outcome) => branches.push(outcome),
                Err(err) => {
                    fatal.get_or_insert(err);
                }
            }
        }
        if let Some(err) = fatal {
            warn!(error = %err, "aborting call");
            return Err(err);
        }

        if timed_out {
            for branch in &mut branches {
                if branch.result == BranchResult::Cancelled {
                    branch.result = BranchResult::TimedOut;
                }
            }
        }
        for branch in &branches {
            usage.record(branch.kind.label(), branch.usage);
        }

        let answer = synthesize(&branches, &self.config.synthesis);
        info!(
            confidence = answer.confidence,
            sources = answer.sources.len(),
            timed_out,
            "answer synthesized"
        );

        Ok(OrchestratorReport {
            answer,
            routing,
            routing_fallback,
            branches,
            timed_out,
            usage,
            elapsed: started.elapsed(),
        })
    }

    async fn route(&self, question: &str) -> (RoutingDecision, bool, Usage) {
        let mut router = self.router.lock().await.clone();
        let request = RouteRequest {
            question: question.to_string(),
        };
        let routed = match router.ready().await {
            Ok(svc) => svc.call(request).await,
            Err(e) => Err(e),
        };
        match routed {
            Ok(Routed { decision, usage }) => (decision, false, usage),
            Err(e) => {
                let fallback = self.config.fallback_route;
                warn!(error = %e, %fallback, "routing failed, using fallback route");
                (
                    RoutingDecision::new(
                        fallback,
                        format!("routing failed ({}), using fallback route {}", e, fallback),
                    ),
                    true,
                    Usage::empty(),
                )
            }
        }
    }

    /// Run one branch. Only a fatal trip or a contract violation is `Err`;
    /// it also cancels the sibling branch.
    async fn run_branch(
        &self,
        kind: AgentKind,
        question: &str,
        supervisor: &GuardrailSupervisor,
        cancel: &CancellationToken,
    ) -> Result<BranchOutcome> {
        let Some(agent) = self.agent(kind) else {
            debug!(%kind, "no agent configured for route");
            return Ok(BranchOutcome::unavailable(kind));
        };

        match supervisor.supervise_agent(agent, question, cancel).await {
            Ok(run) => Ok(BranchOutcome::from_run(run)),
            Err(AgentsError::GuardrailTripped(trip)) if !trip.fatal => {
                let trip = *trip;
                info!(%kind, monitor = %trip.violation.monitor_name, "branch stopped by guardrail");
                let mut outcome = BranchOutcome::from_run(trip.run);
                outcome.result = BranchResult::Tripped {
                    violation: trip.violation,
                };
                Ok(outcome)
            }
            Err(err) => {
                cancel.cancel();
                Err(err)
            }
        }
    }
}
