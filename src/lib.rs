//! # Tower QA
//!
//! A Tower-based question-answering core: bounded tool-calling agents,
//! guardrail supervision, and routed synthesis over a document store and a
//! graph store.
//!
//! ## Core Concepts
//!
//! - **Budget**: per-run, atomically enforced cap on tool calls
//! - **Agent**: a decide/act loop over a decision service and routed tools;
//!   every run owns its own budget and ends in exactly one terminal status
//! - **Guardrails**: monitors raced against a run with two-phase cancellation
//!   (signal, then await the run's actual termination)
//! - **Orchestrator**: routes a question to one or both agents, enforces a
//!   deadline, and synthesizes one order-independent answer
//! - **Static DI**: decision services, routers and stores are injected at
//!   construction time as `tower::Service`s
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_openai::{config::OpenAIConfig, Client};
//! use tower_qa::{
//!     Guardrail, InMemoryDocumentStore, InMemoryGraphStore, MaxQuestionLength,
//!     OpenAIDecider, Orchestrator,
//! };
//!
//! # async fn example() -> tower_qa::Result<()> {
//! let client = Arc::new(Client::<OpenAIConfig>::new());
//! let decider = OpenAIDecider::new(client, "gpt-4o");
//!
//! let orchestrator = Orchestrator::builder()
//!     .config(tower_qa::config::from_env()?)
//!     .document_store(decider.clone(), Arc::new(InMemoryDocumentStore::new(vec![])))
//!     .graph_store(decider, Arc::new(InMemoryGraphStore::new(vec![])))
//!     .guardrail(Guardrail::branch(MaxQuestionLength::new(2_000)))
//!     .build()?;
//!
//! let answer = orchestrator.ask("What patterns lead to churn?").await?;
//! println!("{} (confidence {:.2})", answer.text, answer.confidence);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod budgets;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod items;
pub mod observability;
pub mod orchestrator;
pub mod provider;
pub mod stores;
pub mod tool;
pub mod usage;

pub use agent::{
    policies, AdvicePolicy, Agent, AgentBuilder, AgentRun, CompositePolicy, LoopState, PolicyFn,
    RunProgress, RunSignals, RunStatus,
};
pub use budgets::{Budget, BudgetExceeded};
pub use config::{
    AgentConfig, ConfigBuilder, EvidenceConfig, OrchestratorConfig, StoreLimits, SynthesisConfig,
};
pub use error::{AgentsError, Result};
pub use guardrail::{
    monitor_fn, BlockedPatterns, Guardrail, GuardrailSupervisor, GuardrailTrip, GuardrailViolation,
    MaxQuestionLength, Monitor, MonitorContext, ReadOnlyGraphQueries, ToolErrorStreak,
};
pub use items::{AgentKind, Answer, ToolCall, ToolCallOutcome};
pub use orchestrator::{
    router_fn, BranchOutcome, BranchResult, DecisionRouter, FixedRouter, KeywordRouter,
    Orchestrator, OrchestratorBuilder, OrchestratorReport, QuestionRouter, Route, RoutingDecision,
};
pub use provider::{
    decider_fn, Decided, DeciderSvc, Decision, DecisionContext, DecisionService, OpenAIDecider,
    ScriptedDecider,
};
pub use stores::{
    DocumentStore, GraphSchema, GraphStore, InMemoryDocumentStore, InMemoryGraphStore,
    SchemaProperty,
};
pub use tool::{tool_typed, Observation, ToolDef, ToolError, ToolInvocation, ToolRouter, ToolSpec};
pub use usage::{Usage, UsageStats};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
