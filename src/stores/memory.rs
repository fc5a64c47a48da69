//! In-memory stores for tests, benches and local experiments.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Document, DocumentStore, GraphSchema, GraphStore};
use crate::tool::ToolError;

/// Documents scored by how many query terms they contain.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Vec<Document>,
    failure: Option<ToolError>,
    latency: Option<Duration>,
}

impl InMemoryDocumentStore {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Default::default()
        }
    }

    /// Every search fails with `error`.
    pub fn failing(error: ToolError) -> Self {
        Self {
            failure: Some(error),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn search(
        &self,
        query: &str,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Document>, ToolError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let mut scored: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| tags.is_empty() || d.tags.iter().any(|t| tags.contains(t)))
            .filter_map(|d| {
                let haystack = format!(
                    "{} {}",
                    d.title.as_deref().unwrap_or_default(),
                    d.body.as_deref().unwrap_or_default()
                )
                .to_lowercase();
                let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (hits > 0).then(|| Document {
                    score: 2.5 * hits as f64,
                    ..d.clone()
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Returns the same rows for every query and records the queries it saw.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    rows: Vec<Value>,
    schema: GraphSchema,
    failure: Option<ToolError>,
    queries: Mutex<Vec<String>>,
}

impl InMemoryGraphStore {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn failing(error: ToolError) -> Self {
        Self {
            failure: Some(error),
            ..Default::default()
        }
    }

    pub fn with_schema(mut self, schema: GraphSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Queries that reached the store, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn run_read_query(&self, query: &str, limit: usize) -> Result<Vec<Value>, ToolError> {
        if let Ok(mut seen) = self.queries.lock() {
            seen.push(query.to_string());
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(self.rows.iter().take(limit).cloned().collect())
    }

    async fn schema(&self) -> Result<GraphSchema, ToolError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.schema.clone()),
        }
    }
}
