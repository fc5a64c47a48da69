use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tower_qa::stores::Document;
use tower_qa::{
    Answer, Decision, FixedRouter, InMemoryDocumentStore, InMemoryGraphStore, Orchestrator, Route,
    ScriptedDecider,
};

const CALLS: usize = 4;

// Each branch makes CALLS tool calls against a store with 5ms latency, then finalizes.
fn script(tool: &str, arguments: serde_json::Value, text: &str, source: &str) -> ScriptedDecider {
    let mut decisions: Vec<Decision> = (0..CALLS)
        .map(|_| Decision::call_tool(tool, arguments.clone()))
        .collect();
    decisions.push(Decision::finalize(
        Answer::new(text, 0.7).with_sources([source]),
    ));
    ScriptedDecider::new(decisions)
}

fn build(route: Route) -> Orchestrator {
    let documents = InMemoryDocumentStore::new(
        (1..=20)
            .map(|i| Document {
                question_id: i.to_string(),
                title: Some(format!("Checkout issue {}", i)),
                body: Some("Users abandon checkout when forms are long".into()),
                score: 0.0,
                tags: vec![],
            })
            .collect(),
    )
    .with_latency(Duration::from_millis(5));
    let graph = InMemoryGraphStore::new((1..=20).map(|i| json!({"id": i, "labels": ["Q"]})).collect());

    Orchestrator::builder()
        .router(FixedRouter::new(route))
        .document_store(
            script("search_documents", json!({"query": "checkout"}), "doc", "question_1"),
            Arc::new(documents),
        )
        .graph_store(
            script(
                "query_graph",
                json!({"query": "MATCH (q:Q) RETURN q LIMIT 10"}),
                "graph",
                "node_1",
            )
            .with_delay(Duration::from_millis(5)),
            Arc::new(graph),
        )
        .build()
        .unwrap()
}

fn bench_orchestrator(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    for (name, route) in [
        ("orchestrator_document_only_4calls", Route::DocumentOnly),
        ("orchestrator_both_4calls", Route::Both),
    ] {
        c.bench_function(name, |b| {
            b.to_async(&rt).iter_batched(
                || build(route),
                |orch| async move {
                    let _ = orch
                        .answer("checkout patterns", &[], Duration::from_secs(30))
                        .await
                        .unwrap();
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_orchestrator);
criterion_main!(benches);
