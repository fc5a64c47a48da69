//! Property tests for the tool-call budget.

use std::sync::Arc;

use proptest::prelude::*;
use tower_qa::{Budget, BudgetExceeded};

proptest! {
    #[test]
    fn first_n_succeed_then_exceeded(limit in 0usize..64) {
        let budget = Budget::new(limit);
        for i in 1..=limit {
            prop_assert_eq!(budget.check_and_increment(), Ok(i));
        }
        prop_assert_eq!(
            budget.check_and_increment(),
            Err(BudgetExceeded { limit, used: limit })
        );
        // A refused call never moves the counter.
        prop_assert_eq!(budget.used(), limit);
        prop_assert!(budget.is_exhausted());
    }

    #[test]
    fn reset_restores_the_full_allowance(limit in 0usize..64, take in 0usize..80) {
        let budget = Budget::new(limit);
        for _ in 0..take {
            let _ = budget.check_and_increment();
        }
        prop_assert_eq!(budget.used(), take.min(limit));
        budget.reset();
        prop_assert_eq!(budget.remaining(), limit);
        prop_assert_eq!(budget.used(), 0);
    }

    #[test]
    fn concurrent_callers_never_overshoot(limit in 0usize..32, threads in 1usize..8) {
        let budget = Arc::new(Budget::new(limit));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || {
                    (0..limit + 4)
                        .filter(|_| budget.check_and_increment().is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        prop_assert_eq!(granted, limit);
        prop_assert_eq!(budget.used(), limit);
    }
}
