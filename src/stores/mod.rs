//! Store tool adapters
//!
//! The document store and the graph store are external collaborators. This
//! module only defines the narrow traits the adapters need and the two tool
//! adapters built on them:
//!
//! - `search_documents`: full-text search, scores normalised to `[0, 1]`,
//!   sources reported as `question_<id>`
//! - `query_graph`: read-only graph queries, validated before they reach the
//!   store, capped in row count and serialized size
//! - `get_graph_schema`: node labels, relationship types and their
//!   properties as capped plain text, so queries are not written blind
//!
//! Both stores must be safe for concurrent use; two agents may call them at
//! the same time.

mod memory;

pub use memory::{InMemoryDocumentStore, InMemoryGraphStore};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::StoreLimits;
use crate::tool::{tool_typed, Observation, ToolDef, ToolError};

/// Name of the document search tool.
pub const DOCUMENT_SEARCH_TOOL: &str = "search_documents";
/// Name of the graph query tool.
pub const GRAPH_QUERY_TOOL: &str = "query_graph";
/// Name of the graph schema tool.
pub const GRAPH_SCHEMA_TOOL: &str = "get_graph_schema";

const SCORE_NORMALIZATION_DIVISOR: f64 = 10.0;
const WRITE_CLAUSES: [&str; 5] = ["CREATE", "DELETE", "SET", "REMOVE", "MERGE"];

/// Raw document returned by a text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub question_id: String,
    pub title: Option<String>,
    pub body: Option<String>,
    /// Raw text-search score, unbounded
    pub score: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One hit as presented to the decision function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub content: String,
    pub source: String,
    pub title: Option<String>,
    pub similarity_score: f64,
    pub tags: Vec<String>,
}

impl From<Document> for SearchHit {
    fn from(doc: Document) -> Self {
        let content = [doc.title.as_deref(), doc.body.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            content,
            source: format!("question_{}", doc.question_id),
            title: doc.title,
            similarity_score: normalize_score(doc.score),
            tags: doc.tags,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Text search, best match first. `tags` narrows the search when non-empty.
    async fn search(
        &self,
        query: &str,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Document>, ToolError>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Run an already validated read-only query, returning at most `limit` rows.
    async fn run_read_query(&self, query: &str, limit: usize) -> Result<Vec<Value>, ToolError>;

    /// Node labels, relationship types and their properties.
    async fn schema(&self) -> Result<GraphSchema, ToolError>;
}

/// A property of a node label or relationship type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub name: String,
    /// Observed value types; empty when unknown
    #[serde(default)]
    pub types: Vec<String>,
}

impl SchemaProperty {
    pub fn new<I, S>(name: impl Into<String>, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Shape of the graph, keyed by label and relationship type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSchema {
    #[serde(default)]
    pub node_labels: BTreeMap<String, Vec<SchemaProperty>>,
    #[serde(default)]
    pub relationship_types: BTreeMap<String, Vec<SchemaProperty>>,
}

impl GraphSchema {
    pub fn node(mut self, label: impl Into<String>, properties: Vec<SchemaProperty>) -> Self {
        self.node_labels.insert(label.into(), properties);
        self
    }

    pub fn relationship(mut self, kind: impl Into<String>, properties: Vec<SchemaProperty>) -> Self {
        self.relationship_types.insert(kind.into(), properties);
        self
    }

    /// Plain-text rendering cut to about `max_chars`, and whether it was cut.
    ///
    /// A cut prefers the last line break in the final tenth of the text and
    /// ends with a note saying how much is shown.
    pub fn render(&self, max_chars: usize) -> (String, bool) {
        let mut lines = vec![
            "GRAPH SCHEMA".to_string(),
            "=".repeat(50),
            String::new(),
            "NODE LABELS:".to_string(),
        ];
        push_schema_section(&mut lines, &self.node_labels);
        lines.push(String::new());
        lines.push("RELATIONSHIP TYPES:".to_string());
        push_schema_section(&mut lines, &self.relationship_types);
        let text = lines.join("\n");
        if text.len() <= max_chars {
            return (text, false);
        }

        let mut cut = max_chars;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut head = &text[..cut];
        if let Some(newline) = head.rfind('\n') {
            if newline * 10 > max_chars * 9 {
                head = &head[..newline];
            }
        }
        (
            format!(
                "{}\n\n[Schema truncated - showing first {} characters.]",
                head,
                head.len()
            ),
            true,
        )
    }
}

fn push_schema_section(lines: &mut Vec<String>, entries: &BTreeMap<String, Vec<SchemaProperty>>) {
    for (name, properties) in entries {
        lines.push(format!("  - {}", name));
        if properties.is_empty() {
            continue;
        }
        lines.push("    Properties:".to_string());
        for p in properties {
            let types = if p.types.is_empty() {
                "unknown".to_string()
            } else {
                p.types.join(", ")
            };
            lines.push(format!("      - {}: {}", p.name, types));
        }
    }
}

/// Map a raw text score onto `[0, 1]`.
pub fn normalize_score(score: f64) -> f64 {
    if score.is_nan() || score <= 0.0 {
        return 0.0;
    }
    (score / SCORE_NORMALIZATION_DIVISOR).min(1.0)
}

/// First write clause in `query`, matched on whole words, case-insensitively.
pub fn find_write_clause(query: &str) -> Option<&'static str> {
    words(query).find_map(|w| {
        WRITE_CLAUSES
            .iter()
            .copied()
            .find(|clause| w.eq_ignore_ascii_case(clause))
    })
}

fn words(query: &str) -> impl Iterator<Item = &str> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

/// Reject anything but a well-formed read-only query.
pub fn validate_read_only_query(query: &str) -> Result<(), String> {
    if query.trim().is_empty() {
        return Err("Query is empty".to_string());
    }
    if let Some(clause) = find_write_clause(query) {
        return Err(format!(
            "Forbidden write operation detected: {}. Only read-only queries are allowed.",
            clause
        ));
    }
    let upper: Vec<String> = words(query).map(str::to_uppercase).collect();
    if upper.windows(2).any(|w| w[0] == "GROUP" && w[1] == "BY") {
        return Err(
            "GROUP BY is not allowed. Use WITH aggregation instead (e.g. WITH ... count(...) AS ...)."
                .to_string(),
        );
    }
    for (open, close, what) in [('(', ')', "parentheses"), ('[', ']', "brackets"), ('{', '}', "braces")] {
        let balance = query.matches(open).count() as i64 - query.matches(close).count() as i64;
        if balance != 0 {
            return Err(format!(
                "Unbalanced {}: {} extra {}",
                what,
                balance.abs(),
                if balance > 0 { "opening" } else { "closing" }
            ));
        }
    }
    Ok(())
}

/// `question_<digits>` or `node_<digits>`.
pub fn is_source_id(s: &str) -> bool {
    ["question_", "node_"].iter().any(|prefix| {
        s.strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Collect source ids from graph rows: `question_id` fields, node ids and
/// strings that already are source ids.
fn collect_sources(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(id) = map.get("question_id").and_then(scalar_id) {
                out.insert(format!("question_{}", id));
            }
            if map.contains_key("labels") {
                if let Some(id) = map.get("id").and_then(scalar_id) {
                    out.insert(format!("node_{}", id));
                }
            }
            map.values().for_each(|v| collect_sources(v, out));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_sources(v, out)),
        Value::String(s) if is_source_id(s) => {
            out.insert(s.clone());
        }
        _ => {}
    }
}

fn scalar_id(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => Some(s.clone()),
        _ => None,
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DocumentSearchArgs {
    /// Search query, e.g. "user frustration"
    pub query: String,
    /// Optional tags to filter by, e.g. ["user-behavior", "usability"]
    #[serde(default)]
    pub tags: Vec<String>,
    /// Number of results to return
    pub num_results: Option<usize>,
}

/// Tool adapter over a [`DocumentStore`].
pub fn document_search_tool(store: Arc<dyn DocumentStore>, limits: StoreLimits) -> ToolDef {
    tool_typed(
        DOCUMENT_SEARCH_TOOL,
        "Search discussions for relevant questions and answers. Returns content, \
         source (question_ID), title, similarity_score and tags for each hit.",
        move |args: DocumentSearchArgs| {
            let store = store.clone();
            let limits = limits.clone();
            async move {
                if args.query.trim().is_empty() {
                    return Err(ToolError::fatal("query must not be empty"));
                }
                let num = args
                    .num_results
                    .unwrap_or(limits.default_num_results)
                    .clamp(1, limits.max_results.max(1));
                let docs = store.search(&args.query, &args.tags, num).await?;
                let hits: Vec<SearchHit> = docs.into_iter().take(num).map(SearchHit::from).collect();
                debug!(hits = hits.len(), "document search done");

                let best = hits
                    .iter()
                    .map(|h| h.similarity_score)
                    .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));
                let sources: Vec<String> = hits.iter().map(|h| h.source.clone()).collect();
                let mut obs = Observation::new(serde_json::to_value(&hits).map_err(|e| {
                    ToolError::fatal(format!("could not encode search results: {}", e))
                })?)
                .with_sources(sources);
                if let Some(best) = best {
                    obs = obs.with_relevance(best);
                }
                Ok(obs)
            }
        },
    )
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GraphQueryArgs {
    /// Read-only Cypher query
    pub query: String,
}

/// Tool adapter over a [`GraphStore`].
pub fn graph_query_tool(store: Arc<dyn GraphStore>, limits: StoreLimits) -> ToolDef {
    tool_typed(
        GRAPH_QUERY_TOOL,
        "Run a read-only Cypher query against the graph. Write clauses and GROUP BY are \
         rejected. Add a LIMIT clause to control result size.",
        move |args: GraphQueryArgs| {
            let store = store.clone();
            let limits = limits.clone();
            async move {
                validate_read_only_query(&args.query).map_err(|reason| {
                    warn!(%reason, "graph query rejected");
                    ToolError::fatal(reason)
                })?;

                let max_results = limits.max_results;
                let mut rows = store
                    .run_read_query(&args.query, max_results.saturating_add(1))
                    .await?;
                let mut summary = None;
                let mut truncated = false;
                if rows.len() > max_results {
                    rows.truncate(max_results);
                    truncated = true;
                    summary = Some(format!(
                        "Results truncated to {} records. Add a LIMIT clause to control result size.",
                        max_results
                    ));
                }

                let (kept, size) = fit_rows(&rows, limits.max_result_chars);
                if kept < rows.len() {
                    rows.truncate(kept);
                    truncated = true;
                    summary = Some(format!(
                        "Results truncated to {} records due to size limit ({} chars).",
                        kept, size
                    ));
                }
                if let Some(s) = &summary {
                    warn!(summary = %s, "graph results truncated");
                }

                let mut sources = BTreeSet::new();
                rows.iter().for_each(|r| collect_sources(r, &mut sources));
                Ok(Observation::new(json!({
                    "results": rows,
                    "query": args.query,
                    "summary": summary,
                }))
                .truncated(truncated)
                .with_sources(sources))
            }
        },
    )
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GraphSchemaArgs {}

/// Tool adapter exposing [`GraphStore::schema`] as capped text.
pub fn graph_schema_tool(store: Arc<dyn GraphStore>, limits: StoreLimits) -> ToolDef {
    let max_chars = limits.max_schema_chars;
    tool_typed(
        GRAPH_SCHEMA_TOOL,
        "Describe the graph: node labels, relationship types and their properties. \
         Call it before writing queries when the schema is unknown.",
        move |_: GraphSchemaArgs| {
            let store = store.clone();
            async move {
                let schema = store.schema().await?;
                let (text, truncated) = schema.render(max_chars);
                if truncated {
                    warn!(max_chars, "graph schema truncated");
                }
                Ok(Observation::new(json!({ "schema": text })).truncated(truncated))
            }
        },
    )
}

/// Longest prefix of `rows` whose JSON array encoding fits in `max_chars`,
/// and that encoding's length.
fn fit_rows(rows: &[Value], max_chars: usize) -> (usize, usize) {
    let mut size = 2; // []
    for (i, row) in rows.iter().enumerate() {
        let row_len = row.to_string().len() + usize::from(i > 0);
        if size + row_len > max_chars {
            return (i, size);
        }
        size += row_len;
    }
    (rows.len(), size)
}
