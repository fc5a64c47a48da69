//! Model-decision boundary
//!
//! The language model is an opaque decision function: given a
//! [`DecisionContext`] it answers with one [`Decision`]. Agents ask it whether
//! to call a tool or finalize; the orchestrator asks it for a route. It is a
//! plain call/return `tower::Service`; any streaming a concrete provider does
//! stays inside that provider.
//!
//! Implementations
//! - [`ScriptedDecider`]: replays a fixed script, for tests and benches
//! - [`decider_fn`]: wraps an async closure
//! - [`OpenAIDecider`]: chat completions through `async-openai`
//!
//! A provider that received output it cannot map onto a decision fails with
//! [`MalformedDecision`]; agents treat that like an invalid finalize and allow
//! one corrective round-trip. Any other error fails the run.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolChoiceOption, ChatCompletionToolType, CreateChatCompletionRequestArgs,
        FunctionObjectArgs,
    },
    Client,
};
use schemars::{gen::SchemaSettings, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tower::{util::BoxCloneService, BoxError, Service};
use tracing::debug;

use crate::items::{Answer, ToolCall};
use crate::orchestrator::RoutingDecision;
use crate::tool::ToolSpec;
use crate::usage::Usage;

/// What the caller wants decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPurpose {
    /// Inside an agent loop: call a tool or finalize
    Act,
    /// Orchestrator routing step
    Route,
}

/// Everything the decision function sees for one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub purpose: DecisionPurpose,
    pub agent: String,
    pub question: String,
    pub tools: Vec<ToolSpec>,
    pub calls: Vec<ToolCall>,
    pub remaining_budget: usize,
    /// Validation feedback after a malformed finalize
    pub feedback: Option<String>,
    /// Advisory stop-early hint from the loop policies
    pub advice: Option<String>,
}

impl DecisionContext {
    /// Context for the orchestrator's routing step.
    pub fn routing(question: impl Into<String>) -> Self {
        Self {
            purpose: DecisionPurpose::Route,
            agent: "router".to_string(),
            question: question.into(),
            tools: Vec::new(),
            calls: Vec::new(),
            remaining_budget: 0,
            feedback: None,
            advice: None,
        }
    }
}

/// Result contract of the decision function.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    CallTool { name: String, arguments: Value },
    Finalize(Answer),
    Route(RoutingDecision),
}

impl Decision {
    pub fn call_tool(name: impl Into<String>, arguments: Value) -> Self {
        Decision::CallTool {
            name: name.into(),
            arguments,
        }
    }

    pub fn finalize(answer: Answer) -> Self {
        Decision::Finalize(answer)
    }
}

/// A decision plus the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Decided {
    pub decision: Decision,
    pub usage: Usage,
}

impl From<Decision> for Decided {
    fn from(decision: Decision) -> Self {
        Self {
            decision,
            usage: Usage::empty(),
        }
    }
}

/// Output the provider could not map onto a [`Decision`].
#[derive(Debug, Clone, Error)]
#[error("malformed decision: {reason}")]
pub struct MalformedDecision {
    pub reason: String,
}

pub trait DecisionService:
    Service<DecisionContext, Response = Decided, Error = BoxError>
{
}
impl<T> DecisionService for T where
    T: Service<DecisionContext, Response = Decided, Error = BoxError>
{
}

/// Boxed decision service type alias.
pub type DeciderSvc = BoxCloneService<DecisionContext, Decided, BoxError>;

/// Build a decision service from an async closure.
pub fn decider_fn<F, Fut>(f: F) -> DeciderSvc
where
    F: Fn(DecisionContext) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Decision, BoxError>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(move |ctx: DecisionContext| {
        let f = f.clone();
        async move { f(ctx).await.map(Decided::from) }
    }))
}

// =============================
// Scripted decider
// =============================

/// Replays decisions in order; once the script is exhausted it repeats the
/// fallback decision if one was set, otherwise it errors.
#[derive(Clone, Default)]
pub struct ScriptedDecider {
    script: Arc<Mutex<VecDeque<Decision>>>,
    fallback: Option<Decision>,
    delay: Option<Duration>,
    usage_per_call: Usage,
    seen: Arc<Mutex<Vec<DecisionContext>>>,
}

impl ScriptedDecider {
    pub fn new(script: Vec<Decision>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        }
    }

    /// Always answers with the same decision.
    pub fn repeating(decision: Decision) -> Self {
        Self::new(Vec::new()).then_repeat(decision)
    }

    pub fn then_repeat(mut self, decision: Decision) -> Self {
        self.fallback = Some(decision);
        self
    }

    /// Sleep before every decision (simulates model latency).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage_per_call = usage;
        self
    }

    /// Contexts received so far, in call order.
    pub fn contexts(&self) -> Vec<DecisionContext> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn into_service(self) -> DeciderSvc {
        BoxCloneService::new(self)
    }

    fn next_decision(&self, ctx: DecisionContext) -> Result<Decision, BoxError> {
        self.seen
            .lock()
            .map_err(|_| "scripted decider lock poisoned")?
            .push(ctx);
        let next = self
            .script
            .lock()
            .map_err(|_| "scripted decider lock poisoned")?
            .pop_front();
        match next.or_else(|| self.fallback.clone()) {
            Some(d) => Ok(d),
            None => Err("decision script exhausted".into()),
        }
    }
}

impl Service<DecisionContext> for ScriptedDecider {
    type Response = Decided;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: DecisionContext) -> Self::Future {
        let delay = self.delay;
        let usage = self.usage_per_call;
        let decision = self.next_decision(ctx);
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok(Decided {
                decision: decision?,
                usage,
            })
        })
    }
}

// =============================
// OpenAI-backed decider
// =============================

/// Function the model calls to submit its final answer.
pub const FINALIZE_TOOL: &str = "finalize";
/// Function the model calls to submit a routing decision.
pub const ROUTE_TOOL: &str = "route";

const ACT_INSTRUCTIONS: &str = "You answer the user's question using the tools provided. \
Call one tool at a time. Stop calling tools once you have at least two independently sourced \
relevant observations or one very high-confidence observation. When you are done, call the \
finalize function with your answer, a confidence between 0 and 1 and the source ids taken \
from observations. If the question cannot be answered, finalize with empty text, no sources \
and confidence 0.";

const ROUTE_INSTRUCTIONS: &str = "You route questions to query agents. Use \"document_only\" for \
questions about specific discussions, examples or explanations; \"graph_only\" for questions \
about relationships, correlations, patterns or sequences; \"both\" when the question needs \
examples and patterns together. If unsure, prefer \"document_only\". Call the route function \
with your choice and a short rationale.";

/// Decision service backed by OpenAI chat completions.
#[derive(Clone)]
pub struct OpenAIDecider {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAIDecider {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_tokens(mut self, mt: u32) -> Self {
        self.max_tokens = Some(mt);
        self
    }
}

fn to_openai_tool(spec: &ToolSpec) -> Result<ChatCompletionTool, BoxError> {
    let func = FunctionObjectArgs::default()
        .name(spec.name.clone())
        .description(spec.description.clone())
        .parameters(spec.parameters.clone())
        .build()?;
    Ok(ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(func)
        .build()?)
}

/// Argument schema for `T` with every subschema inlined, as function
/// parameters cannot carry `$ref` definitions.
fn inline_schema<T: JsonSchema>() -> Value {
    let schema = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    serde_json::to_value(schema.schema).unwrap_or(Value::Null)
}

fn finalize_spec() -> ToolSpec {
    ToolSpec {
        name: FINALIZE_TOOL.to_string(),
        description: "Submit the final answer to the question".to_string(),
        parameters: inline_schema::<Answer>(),
    }
}

fn route_spec() -> ToolSpec {
    ToolSpec {
        name: ROUTE_TOOL.to_string(),
        description: "Choose which query agents answer the question".to_string(),
        parameters: inline_schema::<RoutingDecision>(),
    }
}

/// Map a function call from the model onto a decision.
fn parse_tool_call(name: String, arguments: &str) -> Result<Decision, MalformedDecision> {
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    let malformed = |what: String, e: serde_json::Error| MalformedDecision {
        reason: format!("{} arguments are not valid JSON: {}", what, e),
    };
    match name.as_str() {
        FINALIZE_TOOL => serde_json::from_str::<Answer>(arguments)
            .map(Decision::Finalize)
            .map_err(|e| malformed(format!("{} call", FINALIZE_TOOL), e)),
        ROUTE_TOOL => serde_json::from_str::<RoutingDecision>(arguments)
            .map(Decision::Route)
            .map_err(|e| malformed(format!("{} call", ROUTE_TOOL), e)),
        _ => match serde_json::from_str::<Value>(arguments) {
            Ok(arguments) => Ok(Decision::call_tool(name, arguments)),
            Err(e) => Err(malformed(format!("tool {}", name), e)),
        },
    }
}

fn user_prompt(ctx: &DecisionContext) -> Result<String, BoxError> {
    let mut prompt = format!("Question: {}", ctx.question);
    if ctx.purpose == DecisionPurpose::Act {
        prompt.push_str(&format!(
            "\n\nTool calls so far:\n{}\n\nRemaining tool calls: {}",
            serde_json::to_string_pretty(&ctx.calls)?,
            ctx.remaining_budget
        ));
    }
    if let Some(advice) = &ctx.advice {
        prompt.push_str(&format!("\n\nAdvice: {}", advice));
    }
    if let Some(feedback) = &ctx.feedback {
        prompt.push_str(&format!(
            "\n\nYour previous reply was rejected: {}. Reply again with a valid call.",
            feedback
        ));
    }
    Ok(prompt)
}

/// Strip an optional markdown code fence around a JSON reply.
fn json_body(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn parse_content(purpose: DecisionPurpose, content: &str) -> Result<Decision, MalformedDecision> {
    let body = json_body(content);
    match purpose {
        DecisionPurpose::Act => serde_json::from_str::<Answer>(body)
            .map(Decision::Finalize)
            .map_err(|e| MalformedDecision {
                reason: format!("final answer is not valid JSON: {}", e),
            }),
        DecisionPurpose::Route => serde_json::from_str::<RoutingDecision>(body)
            .map(Decision::Route)
            .map_err(|e| MalformedDecision {
                reason: format!("routing decision is not valid JSON: {}", e),
            }),
    }
}

impl Service<DecisionContext> for OpenAIDecider {
    type Response = Decided;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: DecisionContext) -> Self::Future {
        let client = self.client.clone();
        let model = self.model.clone();
        let temperature = self.temperature;
        let max_tokens = self.max_tokens;
        Box::pin(async move {
            let instructions = match ctx.purpose {
                DecisionPurpose::Act => ACT_INSTRUCTIONS,
                DecisionPurpose::Route => ROUTE_INSTRUCTIONS,
            };
            let messages: Vec<ChatCompletionRequestMessage> = vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(instructions)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt(&ctx)?)
                    .build()?
                    .into(),
            ];

            let specs = match ctx.purpose {
                DecisionPurpose::Act => {
                    let mut specs = ctx.tools.clone();
                    specs.push(finalize_spec());
                    specs
                }
                DecisionPurpose::Route => vec![route_spec()],
            };
            let tools = specs
                .iter()
                .map(to_openai_tool)
                .collect::<Result<Vec<_>, _>>()?;

            let mut builder = CreateChatCompletionRequestArgs::default();
            builder
                .model(&model)
                .messages(messages)
                .tools(tools)
                .tool_choice(ChatCompletionToolChoiceOption::Required);
            if let Some(t) = temperature {
                builder.temperature(t);
            }
            if let Some(mt) = max_tokens {
                builder.max_tokens(mt);
            }

            let response = client.chat().create(builder.build()?).await?;
            let usage = response
                .usage
                .as_ref()
                .map(|u| Usage::new(u.prompt_tokens as usize, u.completion_tokens as usize))
                .unwrap_or_else(Usage::empty);

            let choice = response.choices.into_iter().next().ok_or_else(|| MalformedDecision {
                reason: "no choices in response".to_string(),
            })?;

            if let Some(call) = choice.message.tool_calls.and_then(|c| c.into_iter().next()) {
                debug!(tool = %call.function.name, "model called a function");
                let decision = parse_tool_call(call.function.name, &call.function.arguments)?;
                return Ok(Decided { decision, usage });
            }

            // Some models answer with a bare JSON object instead of a call.
            let content = choice.message.content.unwrap_or_default();
            let decision = parse_content(ctx.purpose, &content)?;
            Ok(Decided { decision, usage })
        })
    }
}
