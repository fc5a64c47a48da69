//! Tool adapter boundary
//!
//! A tool is a `tower::Service<ToolInvocation, Response = Observation>` whose
//! domain failures are `ToolError`s carried in the `BoxError`. Agents treat
//! every tool uniformly: they never interpret store-specific semantics.
//!
//! - `ToolDef` pairs a declared capability (`ToolSpec`) with its service
//! - `tool_typed` derives the argument schema from a `JsonSchema` type
//! - `ToolRouter` dispatches by name with an unknown-tool fallback
//! - `ToolTimeoutLayer` bounds a single invocation

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tower::{util::BoxCloneService, BoxError, Layer, Service, ServiceExt};

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Successful tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub data: Value,
    /// The store returned more than fits into `data`
    #[serde(default)]
    pub truncated: bool,
    /// Source identifiers found in `data`
    #[serde(default)]
    pub sources: Vec<String>,
    /// Best relevance score in `[0, 1]`, when the store reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

impl Observation {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            truncated: false,
            sources: Vec::new(),
            relevance: None,
        }
    }

    pub fn truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = Some(relevance.clamp(0.0, 1.0));
        self
    }

    /// True when the observation carries no data at all.
    pub fn is_empty(&self) -> bool {
        match &self.data {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

/// Domain failure of a tool, e.g. the store is unreachable or the arguments
/// were rejected. Recorded in the call log and fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Declared capability of a tool, handed to the decision function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneService<ToolInvocation, Observation, BoxError>;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Observation, ToolError>> + Send + Sync>;

/// Definition of a tool: capability + service implementation.
pub struct ToolDef {
    pub spec: ToolSpec,
    pub service: ToolSvc,
}

impl ToolDef {
    /// Create a tool definition from a handler taking raw JSON arguments.
    pub fn from_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Handler,
    ) -> Self {
        let name = name.into();
        let expected = name.clone();
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            let expected = expected.clone();
            async move {
                if inv.name != expected {
                    return Err::<Observation, BoxError>(Box::new(ToolError::fatal(format!(
                        "routed to wrong tool: expected={}, got={}",
                        expected, inv.name
                    ))));
                }
                (handler)(inv.arguments).await.map_err(BoxError::from)
            }
        });
        Self {
            spec: ToolSpec {
                name,
                description: description.into(),
                parameters,
            },
            service: BoxCloneService::new(svc),
        }
    }

    /// Create a tool from an arbitrary service; the caller supplies the capability.
    pub fn from_service<S>(spec: ToolSpec, service: S) -> Self
    where
        S: Service<ToolInvocation, Response = Observation, Error = BoxError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            spec,
            service: BoxCloneService::new(service),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Create a tool from a typed handler.
/// - `A` is the argument struct (Deserialize + JsonSchema)
/// - arguments that fail to deserialize become a non-retryable `ToolError`
pub fn tool_typed<A, H, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: H,
) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Observation, ToolError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let parameters = serde_json::to_value(schema.schema).unwrap_or(Value::Null);
    let handler = Arc::new(handler);
    let erased: Handler = Arc::new(move |raw: Value| -> BoxFuture<'static, Result<Observation, ToolError>> {
        let h = handler.clone();
        Box::pin(async move {
            let args: A = serde_json::from_value(raw)
                .map_err(|e| ToolError::fatal(format!("invalid arguments: {}", e)))?;
            (h.as_ref())(args).await
        })
    });
    ToolDef::from_handler(name, description, parameters, erased)
}

/// Router service over tools using a name → index table.
#[derive(Clone)]
pub struct ToolRouter {
    name_to_index: HashMap<String, usize>,
    services: Vec<ToolSvc>, // index 0 is the unknown-tool fallback
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> (Self, Vec<ToolSpec>) {
        let unknown = BoxCloneService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Err::<Observation, BoxError>(Box::new(ToolError::fatal(format!(
                "unknown tool: {}",
                inv.name
            ))))
        }));

        let mut services: Vec<ToolSvc> = vec![unknown];
        let mut specs = Vec::with_capacity(tools.len());
        let mut name_to_index = HashMap::new();

        for (i, td) in tools.into_iter().enumerate() {
            name_to_index.insert(td.spec.name.clone(), i + 1);
            specs.push(td.spec);
            services.push(td.service);
        }

        (
            Self {
                name_to_index,
                services,
            },
            specs,
        )
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = Observation;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is awaited per selected service inside `call`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let idx = self
            .name_to_index
            .get(req.name.as_str())
            .copied()
            .unwrap_or(0);
        let mut svc = self.services[idx].clone();
        Box::pin(async move { svc.ready().await?.call(req).await })
    }
}

/// Layer bounding each tool invocation; an elapsed timeout is a retryable `ToolError`.
#[derive(Debug, Clone, Copy)]
pub struct ToolTimeoutLayer {
    timeout: Duration,
}

impl ToolTimeoutLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Debug, Clone)]
pub struct ToolTimeout<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Layer<S> for ToolTimeoutLayer {
    type Service = ToolTimeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        ToolTimeout {
            inner,
            timeout: self.timeout,
        }
    }
}

impl<S> Service<ToolInvocation> for ToolTimeout<S>
where
    S: Service<ToolInvocation, Response = Observation, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Observation;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let name = req.name.clone();
        let limit = self.timeout;
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => Err(Box::new(ToolError::retryable(format!(
                    "tool {} timed out after {:?}",
                    name, limit
                ))) as BoxError),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    fn echo_tool() -> ToolDef {
        tool_typed("echo", "Echo text back", |args: EchoArgs| async move {
            Ok(Observation::new(json!({ "echo": args.text })).with_sources(["node_1"]))
        })
    }

    fn inv(name: &str, arguments: Value) -> ToolInvocation {
        ToolInvocation {
            id: "call_1".into(),
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn typed_tool_parses_arguments() {
        let mut tool = echo_tool();
        assert_eq!(tool.name(), "echo");
        assert!(tool.spec.parameters["properties"]["text"].is_object());
        let obs = tool
            .service
            .ready()
            .await
            .unwrap()
            .call(inv("echo", json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(obs.data["echo"], "hi");
        assert_eq!(obs.sources, vec!["node_1".to_string()]);
    }

    #[tokio::test]
    async fn typed_tool_rejects_bad_arguments_as_tool_error() {
        let mut tool = echo_tool();
        let err = tool
            .service
            .ready()
            .await
            .unwrap()
            .call(inv("echo", json!({"wrong": 1})))
            .await
            .unwrap_err();
        let te = err.downcast::<ToolError>().expect("tool error");
        assert!(!te.retryable);
        assert!(te.message.contains("invalid arguments"));
    }

    #[tokio::test]
    async fn router_dispatches_and_falls_back() {
        let (mut router, specs) = ToolRouter::new(vec![echo_tool()]);
        assert_eq!(specs.len(), 1);
        let ok = router
            .ready()
            .await
            .unwrap()
            .call(inv("echo", json!({"text": "x"})))
            .await
            .unwrap();
        assert_eq!(ok.data["echo"], "x");

        let err = router
            .ready()
            .await
            .unwrap()
            .call(inv("missing", Value::Null))
            .await
            .unwrap_err();
        let te = err.downcast::<ToolError>().expect("tool error");
        assert_eq!(te.message, "unknown tool: missing");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_layer_maps_elapsed_to_retryable_error() {
        let slow = tower::service_fn(|_inv: ToolInvocation| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BoxError>(Observation::new(Value::Null))
        });
        let mut svc = ToolTimeoutLayer::new(Duration::from_millis(100)).layer(slow);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(inv("slow", Value::Null))
            .await
            .unwrap_err();
        let te = err.downcast::<ToolError>().expect("tool error");
        assert!(te.retryable);
    }

    #[test]
    fn observation_emptiness() {
        assert!(Observation::new(Value::Null).is_empty());
        assert!(Observation::new(json!([])).is_empty());
        assert!(!Observation::new(json!([1])).is_empty());
        assert_eq!(
            Observation::new(json!(1)).with_relevance(3.0).relevance,
            Some(1.0)
        );
    }
}
