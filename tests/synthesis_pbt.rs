//! Property tests for answer synthesis.

use proptest::prelude::*;
use tower_qa::orchestrator::synthesis::{combined_confidence, synthesize};
use tower_qa::{AgentKind, Answer, BranchOutcome, BranchResult, SynthesisConfig};

fn answer() -> impl Strategy<Value = Answer> {
    (
        "[a-z ]{0,24}",
        0.0f64..=1.0,
        prop::collection::btree_set("(question|node)_[0-9]{1,3}", 0..4),
    )
        .prop_map(|(text, confidence, sources)| {
            let text = if text.trim().is_empty() { "x".to_string() } else { text };
            Answer::new(text, confidence).with_sources(sources)
        })
}

fn result() -> impl Strategy<Value = BranchResult> {
    prop_oneof![
        answer().prop_map(|answer| BranchResult::Answered { answer }),
        (0usize..8, prop::option::of(answer()))
            .prop_map(|(limit, salvaged)| BranchResult::BudgetExceeded { limit, salvaged }),
        "[a-z ]{1,16}".prop_map(|reason| BranchResult::Failed { reason }),
        Just(BranchResult::Cancelled),
        Just(BranchResult::TimedOut),
        Just(BranchResult::Unavailable),
    ]
}

proptest! {
    #[test]
    fn synthesis_is_order_independent(doc in result(), graph in result(), threshold in 0.0f64..1.0) {
        let cfg = SynthesisConfig { disagreement_threshold: threshold };
        let d = BranchOutcome::new(AgentKind::Document, doc);
        let g = BranchOutcome::new(AgentKind::Graph, graph);
        let forward = synthesize(&[d.clone(), g.clone()], &cfg);
        let backward = synthesize(&[g, d], &cfg);
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn synthesized_answers_are_valid(doc in result(), graph in result()) {
        let cfg = SynthesisConfig::default();
        let both = [
            BranchOutcome::new(AgentKind::Document, doc),
            BranchOutcome::new(AgentKind::Graph, graph),
        ];
        let a = synthesize(&both, &cfg);
        prop_assert!(a.validate().is_ok());
        // one success is never degraded
        let answered: Vec<f64> = both
            .iter()
            .filter_map(|b| b.result.answer().map(|a| a.confidence))
            .collect();
        if answered.len() == 1 {
            prop_assert_eq!(a.confidence, answered[0]);
        }
        if answered.is_empty() {
            prop_assert_eq!(a.confidence, 0.0);
        }
    }

    #[test]
    fn combined_confidence_lies_between_inputs(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
        let c = combined_confidence(a, b);
        prop_assert!(c >= a.min(b) && c <= a.max(b));
        prop_assert_eq!(c, combined_confidence(b, a));
    }
}
