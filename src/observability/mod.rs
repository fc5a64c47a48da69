//! Observability: tracing and metrics around tool calls
//!
//! What this module provides
//! - Structured spans and outcome logs around every routed tool invocation
//! - Optional counters and latency histograms pushed to an injected collector
//!
//! Exports
//! - Models
//!   - `MetricRecord::{Counter{name, value}, Histogram{name, value}}`
//! - Layers
//!   - `ToolTracingLayer` creating spans with fields: agent, tool, call_id
//!   - `ToolMetricsLayer<C>` where `C: MetricsCollector`
//! - Services
//!   - `MetricsCollector: Service<MetricRecord, Response=()>`
//! - Helpers
//!   - `truncate_for_log` for question fields
//!
//! Composition
//! - `AgentBuilder` always applies `ToolTracingLayer`; `ToolMetricsLayer` is
//!   applied when a collector is configured
//!
//! Testing strategy
//! - Use a fake collector capturing records; assert counts/histograms updated as expected

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tower::{util::BoxCloneService, BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info_span, warn, Instrument};

use crate::tool::{Observation, ToolError, ToolInvocation};

/// Default cut-off for questions logged as span fields.
pub const DEFAULT_QUESTION_LOG_CHARS: usize = 100;

/// Cut `text` to at most `max_chars` characters for logging.
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricRecord {
    Counter { name: &'static str, value: u64 },
    Histogram { name: &'static str, value: u64 },
}

pub trait MetricsCollector: Service<MetricRecord, Response = (), Error = BoxError> {}
impl<T> MetricsCollector for T where T: Service<MetricRecord, Response = (), Error = BoxError> {}

/// Boxed collector accepted by the agent builder.
pub type MetricsSink = BoxCloneService<MetricRecord, (), BoxError>;

/// Layer that adds a tracing span around each tool invocation.
#[derive(Debug, Clone)]
pub struct ToolTracingLayer {
    agent: String,
}

impl ToolTracingLayer {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolTracing<S> {
    inner: S,
    agent: String,
}

impl<S> Layer<S> for ToolTracingLayer {
    type Service = ToolTracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        ToolTracing {
            inner,
            agent: self.agent.clone(),
        }
    }
}

impl<S> Service<ToolInvocation> for ToolTracing<S>
where
    S: Service<ToolInvocation, Response = Observation, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Observation;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let span = info_span!("tool", agent = %self.agent, tool = %req.name, call_id = %req.id);
        let started = Instant::now();
        let fut = self.inner.call(req);
        Box::pin(
            async move {
                let out = fut.await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &out {
                    Ok(obs) => debug!(
                        elapsed_ms,
                        truncated = obs.truncated,
                        sources = obs.sources.len(),
                        "tool ok"
                    ),
                    Err(e) => match e.downcast_ref::<ToolError>() {
                        Some(te) => warn!(elapsed_ms, retryable = te.retryable, error = %te, "tool error"),
                        None => warn!(elapsed_ms, error = %e, "tool failed outside its contract"),
                    },
                }
                out
            }
            .instrument(span),
        )
    }
}

/// Layer that reports tool call counts, errors and latency to a collector.
#[derive(Clone)]
pub struct ToolMetricsLayer<C> {
    collector: C,
}

impl<C> ToolMetricsLayer<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }
}

#[derive(Clone)]
pub struct ToolMetrics<S, C> {
    inner: S,
    collector: C,
}

impl<S, C> Layer<S> for ToolMetricsLayer<C>
where
    C: Clone,
{
    type Service = ToolMetrics<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        ToolMetrics {
            inner,
            collector: self.collector.clone(),
        }
    }
}

impl<S, C> Service<ToolInvocation> for ToolMetrics<S, C>
where
    S: Service<ToolInvocation, Response = Observation, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    C: MetricsCollector + Clone + Send + 'static,
    C::Future: Send + 'static,
{
    type Response = Observation;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let mut collector = self.collector.clone();
        let started = Instant::now();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let out = fut.await;
            let records = [
                MetricRecord::Counter {
                    name: "tool_calls",
                    value: 1,
                },
                MetricRecord::Counter {
                    name: "tool_errors",
                    value: u64::from(out.is_err()),
                },
                MetricRecord::Histogram {
                    name: "tool_latency_ms",
                    value: started.elapsed().as_millis() as u64,
                },
            ];
            // Collector failures never affect the tool result.
            for record in records {
                if let Ok(ready) = ServiceExt::ready(&mut collector).await {
                    let _ = ready.call(record).await;
                }
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::service_fn;

    fn inv() -> ToolInvocation {
        ToolInvocation {
            id: "run-1".into(),
            name: "query_graph".into(),
            arguments: Value::Null,
        }
    }

    #[tokio::test]
    async fn metrics_layer_updates_collector() {
        let inner = service_fn(|_inv: ToolInvocation| async move {
            Err::<Observation, BoxError>(Box::new(ToolError::retryable("down")))
        });
        let sink = Arc::new(tokio::sync::Mutex::new(Vec::<MetricRecord>::new()));
        let sink_cl = sink.clone();
        let collector = service_fn(move |rec: MetricRecord| {
            let sink = sink_cl.clone();
            async move {
                sink.lock().await.push(rec);
                Ok::<(), BoxError>(())
            }
        });
        let mut svc = ToolMetricsLayer::new(collector).layer(inner);
        let res = ServiceExt::ready(&mut svc).await.unwrap().call(inv()).await;
        assert!(res.is_err());
        let data = sink.lock().await.clone();
        assert!(data.contains(&MetricRecord::Counter {
            name: "tool_calls",
            value: 1
        }));
        assert!(data.contains(&MetricRecord::Counter {
            name: "tool_errors",
            value: 1
        }));
        assert!(data
            .iter()
            .any(|r| matches!(r, MetricRecord::Histogram { name: "tool_latency_ms", .. })));
    }

    #[tokio::test]
    async fn tracing_layer_passes_results_through() {
        let inner = service_fn(|_inv: ToolInvocation| async move {
            Ok::<_, BoxError>(Observation::new(Value::from(3)))
        });
        let mut svc = ToolTracingLayer::new("graph").layer(inner);
        let obs = ServiceExt::ready(&mut svc).await.unwrap().call(inv()).await.unwrap();
        assert_eq!(obs.data, Value::from(3));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("ééééé", 2), "éé...");
    }
}
