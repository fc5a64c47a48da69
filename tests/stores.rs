//! Store tool adapters driven through their tower services.

use std::sync::Arc;

use serde_json::{json, Value};
use tower::{BoxError, Service, ServiceExt};
use tower_qa::stores::{
    document_search_tool, graph_query_tool, graph_schema_tool, Document, GraphSchema,
    SchemaProperty, DOCUMENT_SEARCH_TOOL, GRAPH_QUERY_TOOL, GRAPH_SCHEMA_TOOL,
};
use tower_qa::{
    InMemoryDocumentStore, InMemoryGraphStore, Observation, StoreLimits, ToolDef, ToolError,
    ToolInvocation,
};

async fn invoke(tool: &mut ToolDef, arguments: Value) -> Result<Observation, ToolError> {
    let invocation = ToolInvocation {
        id: "call-1".into(),
        name: tool.spec.name.clone(),
        arguments,
    };
    let result: Result<Observation, BoxError> = async {
        tool.service.ready().await?.call(invocation).await
    }
    .await;
    result.map_err(|e| match e.downcast::<ToolError>() {
        Ok(te) => *te,
        Err(other) => panic!("tool broke its contract: {other}"),
    })
}

fn documents(n: usize) -> Vec<Document> {
    (1..=n)
        .map(|i| Document {
            question_id: i.to_string(),
            title: Some(format!("Checkout question {}", i)),
            body: Some("Users abandon checkout when forms are long".into()),
            score: 0.0,
            tags: if i % 2 == 0 {
                vec!["usability".into()]
            } else {
                vec!["payments".into()]
            },
        })
        .collect()
}

fn limits(max_results: usize, max_result_chars: usize) -> StoreLimits {
    StoreLimits {
        default_num_results: max_results.min(5),
        max_results,
        max_result_chars,
        ..StoreLimits::default()
    }
}

#[tokio::test]
async fn document_search_reports_sources_and_relevance() {
    let store = Arc::new(InMemoryDocumentStore::new(documents(8)));
    let mut tool = document_search_tool(store, StoreLimits::default());
    assert_eq!(tool.name(), DOCUMENT_SEARCH_TOOL);
    assert!(tool.spec.parameters["properties"]["query"].is_object());

    let obs = invoke(&mut tool, json!({"query": "checkout forms"})).await.unwrap();
    // default_num_results
    assert_eq!(obs.sources.len(), 5);
    assert!(obs.sources.iter().all(|s| s.starts_with("question_")));
    assert_eq!(obs.relevance, Some(0.5));
    let hits = obs.data.as_array().unwrap();
    assert_eq!(hits[0]["similarity_score"], json!(0.5));
}

#[tokio::test]
async fn document_search_caps_and_filters() {
    let store = Arc::new(InMemoryDocumentStore::new(documents(8)));
    let mut tool = document_search_tool(store, limits(3, 50_000));

    let obs = invoke(&mut tool, json!({"query": "checkout", "num_results": 500}))
        .await
        .unwrap();
    assert_eq!(obs.sources.len(), 3);

    let obs = invoke(
        &mut tool,
        json!({"query": "checkout", "tags": ["usability"], "num_results": 3}),
    )
    .await
    .unwrap();
    assert_eq!(obs.sources, vec!["question_2", "question_4", "question_6"]);

    let obs = invoke(&mut tool, json!({"query": "refunds"})).await.unwrap();
    assert!(obs.is_empty());
    assert_eq!(obs.relevance, None);
}

#[tokio::test]
async fn document_search_errors() {
    let store = Arc::new(InMemoryDocumentStore::new(documents(1)));
    let mut tool = document_search_tool(store, StoreLimits::default());
    let err = invoke(&mut tool, json!({"query": "   "})).await.unwrap_err();
    assert!(!err.retryable);

    let err = invoke(&mut tool, json!({"tags": []})).await.unwrap_err();
    assert!(err.message.starts_with("invalid arguments"));

    let down = Arc::new(InMemoryDocumentStore::failing(ToolError::retryable(
        "connection refused",
    )));
    let mut tool = document_search_tool(down, StoreLimits::default());
    let err = invoke(&mut tool, json!({"query": "checkout"})).await.unwrap_err();
    assert!(err.retryable);
    assert_eq!(err.message, "connection refused");
}

#[tokio::test]
async fn graph_queries_are_validated_before_the_store() {
    let store = Arc::new(InMemoryGraphStore::new(vec![json!({"n": 1})]));
    let mut tool = graph_query_tool(store.clone(), StoreLimits::default());
    assert_eq!(tool.name(), GRAPH_QUERY_TOOL);

    for (query, expected) in [
        ("CREATE (n:Node)", "Forbidden write operation detected: CREATE"),
        ("MATCH (n) RETURN n.tag, count(*) GROUP BY n.tag", "GROUP BY is not allowed"),
        ("MATCH (n RETURN n", "Unbalanced parentheses: 1 extra opening"),
        ("", "Query is empty"),
    ] {
        let err = invoke(&mut tool, json!({ "query": query })).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.starts_with(expected), "{query}: {}", err.message);
    }
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn graph_results_are_capped_by_count() {
    let rows: Vec<Value> = (1..=5)
        .map(|i| json!({"q": {"id": i, "labels": ["Question"]}}))
        .collect();
    let store = Arc::new(InMemoryGraphStore::new(rows));
    let mut tool = graph_query_tool(store.clone(), limits(3, 50_000));

    let obs = invoke(&mut tool, json!({"query": "MATCH (q:Question) RETURN q"}))
        .await
        .unwrap();
    assert!(obs.truncated);
    assert_eq!(obs.data["results"].as_array().unwrap().len(), 3);
    assert_eq!(obs.sources, vec!["node_1", "node_2", "node_3"]);
    assert!(obs.data["summary"]
        .as_str()
        .unwrap()
        .starts_with("Results truncated to 3 records"));
    assert_eq!(store.queries(), vec!["MATCH (q:Question) RETURN q".to_string()]);
}

#[tokio::test]
async fn graph_results_are_capped_by_size() {
    let rows: Vec<Value> = (0..10).map(|i| json!({"i": i})).collect();
    let store = Arc::new(InMemoryGraphStore::new(rows));
    let mut tool = graph_query_tool(store, limits(100, 2 + 7 * 3 + 2));

    let obs = invoke(&mut tool, json!({"query": "MATCH (n) RETURN n.i AS i"}))
        .await
        .unwrap();
    assert!(obs.truncated);
    assert_eq!(obs.data["results"].as_array().unwrap().len(), 3);
    assert!(obs.data["summary"]
        .as_str()
        .unwrap()
        .contains("due to size limit"));
}

#[tokio::test]
async fn small_graph_results_are_untouched() {
    let store = Arc::new(InMemoryGraphStore::new(vec![
        json!({"source": "question_4", "count": 2}),
    ]));
    let mut tool = graph_query_tool(store, StoreLimits::default());
    let obs = invoke(&mut tool, json!({"query": "MATCH (n) RETURN n LIMIT 1"}))
        .await
        .unwrap();
    assert!(!obs.truncated);
    assert_eq!(obs.data["summary"], Value::Null);
    assert_eq!(obs.sources, vec!["question_4"]);
}

fn stack_exchange_schema() -> GraphSchema {
    GraphSchema::default()
        .node(
            "Question",
            vec![
                SchemaProperty::new("id", ["Long"]),
                SchemaProperty::new("title", ["String"]),
                SchemaProperty::new("score", ["Long"]),
            ],
        )
        .node("User", vec![SchemaProperty::new("reputation", ["Long"])])
        .node("Tag", vec![SchemaProperty::new("name", ["String"])])
        .relationship("ASKED", vec![])
        .relationship("TAGGED", vec![])
}

#[tokio::test]
async fn graph_schema_describes_labels_and_relationships() {
    let store = Arc::new(InMemoryGraphStore::new(vec![]).with_schema(stack_exchange_schema()));
    let mut tool = graph_schema_tool(store.clone(), StoreLimits::default());
    assert_eq!(tool.name(), GRAPH_SCHEMA_TOOL);

    let obs = invoke(&mut tool, json!({})).await.unwrap();
    assert!(!obs.truncated);
    let text = obs.data["schema"].as_str().unwrap();
    assert!(text.contains("NODE LABELS:\n  - Question\n    Properties:\n      - id: Long"));
    assert!(text.contains("RELATIONSHIP TYPES:\n  - ASKED\n  - TAGGED"));
    // Schema discovery never runs a query.
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn graph_schema_is_capped() {
    let store = Arc::new(InMemoryGraphStore::new(vec![]).with_schema(stack_exchange_schema()));
    let limits = StoreLimits {
        max_schema_chars: 60,
        ..StoreLimits::default()
    };
    let mut tool = graph_schema_tool(store, limits);

    let obs = invoke(&mut tool, json!({})).await.unwrap();
    assert!(obs.truncated);
    let text = obs.data["schema"].as_str().unwrap();
    assert!(text.contains("[Schema truncated - showing first"));
    assert!(!text.contains("TAGGED"));
}

#[tokio::test]
async fn graph_schema_errors_come_from_the_store() {
    let down = Arc::new(InMemoryGraphStore::failing(ToolError::retryable("graph offline")));
    let mut tool = graph_schema_tool(down, StoreLimits::default());
    let err = invoke(&mut tool, json!({})).await.unwrap_err();
    assert!(err.retryable);
    assert_eq!(err.message, "graph offline");
}
