//! Property tests for retry transitions

use super::*;
use crate::transport::StreamErrorKind;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum AttemptResult {
    Succeeded,
    Failed(StreamErrorKind),
    Cancelled { partial: String },
}

fn arb_kind() -> impl Strategy<Value = StreamErrorKind> {
    prop_oneof![
        Just(StreamErrorKind::Network),
        Just(StreamErrorKind::Transient),
        Just(StreamErrorKind::Protocol),
    ]
}

fn arb_attempt_result() -> impl Strategy<Value = AttemptResult> {
    prop_oneof![
        1 => Just(AttemptResult::Succeeded),
        4 => arb_kind().prop_map(AttemptResult::Failed),
        1 => "[a-z]{0,3}".prop_map(|partial| AttemptResult::Cancelled { partial }),
    ]
}

/// Drive the machine the way the executor would, feeding scripted results
/// to each `RunAttempt` and elapsing every backoff.
fn drive(
    policy: &RetryPolicy,
    results: &[AttemptResult],
) -> (RetryState, Vec<RetryEffect>) {
    let mut state = RetryState::Idle;
    let mut effects = Vec::new();
    let mut pending = vec![RetryEvent::Start];
    let mut next_result = results.iter();

    while let Some(event) = pending.pop() {
        let result = transition(&state, policy, event).expect("driver only sends valid events");
        state = result.new_state;
        for effect in result.effects {
            match &effect {
                RetryEffect::RunAttempt { .. } => {
                    let event = match next_result.next() {
                        Some(AttemptResult::Succeeded) | None => RetryEvent::AttemptSucceeded,
                        Some(AttemptResult::Failed(kind)) => RetryEvent::AttemptFailed {
                            kind: *kind,
                            message: "err".to_string(),
                            partial: String::new(),
                        },
                        Some(AttemptResult::Cancelled { partial }) => RetryEvent::AttemptCancelled {
                            partial: partial.clone(),
                        },
                    };
                    pending.push(event);
                }
                RetryEffect::Backoff { .. } => pending.push(RetryEvent::BackoffElapsed),
                _ => {}
            }
            effects.push(effect);
        }
    }
    (state, effects)
}

proptest! {
    #[test]
    fn attempts_never_exceed_budget(
        max_attempts in 1u32..6,
        results in prop::collection::vec(arb_attempt_result(), 0..10),
    ) {
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(10));
        let (state, effects) = drive(&policy, &results);

        let attempts = effects
            .iter()
            .filter(|e| matches!(e, RetryEffect::RunAttempt { .. }))
            .count();
        prop_assert!(attempts >= 1);
        prop_assert!(attempts <= max_attempts as usize);
        prop_assert!(state.is_terminal());
    }

    #[test]
    fn only_retryable_failures_back_off(
        results in prop::collection::vec(arb_attempt_result(), 0..10),
    ) {
        let policy = RetryPolicy::default();
        let (_, effects) = drive(&policy, &results);

        let backoffs = effects
            .iter()
            .filter(|e| matches!(e, RetryEffect::Backoff { .. }))
            .count();
        let retryable_before_terminal = results
            .iter()
            .take(policy.max_attempts as usize - 1)
            .take_while(|r| matches!(r, AttemptResult::Failed(k) if k.is_retryable()))
            .count();
        prop_assert_eq!(backoffs, retryable_before_terminal);
    }

    #[test]
    fn backoff_delays_grow(
        kinds in prop::collection::vec(
            prop_oneof![Just(StreamErrorKind::Network), Just(StreamErrorKind::Transient)],
            5,
        ),
    ) {
        let policy = RetryPolicy::new(6, Duration::from_millis(100));
        let results: Vec<_> = kinds.into_iter().map(AttemptResult::Failed).collect();
        let (_, effects) = drive(&policy, &results);

        let delays: Vec<Duration> = effects
            .iter()
            .filter_map(|e| match e {
                RetryEffect::Backoff { delay } => Some(*delay),
                _ => None,
            })
            .collect();
        prop_assert_eq!(delays.len(), 5);
        for pair in delays.windows(2) {
            prop_assert_eq!(pair[1], pair[0] * 2);
        }
    }

    #[test]
    fn stopped_marker_only_for_empty_cancellation(partial in "[a-z]{0,3}") {
        let policy = RetryPolicy::default();
        let (state, effects) = drive(
            &policy,
            &[AttemptResult::Cancelled { partial: partial.clone() }],
        );

        prop_assert_eq!(state, RetryState::Cancelled);
        let marked = effects.contains(&RetryEffect::MarkStopped);
        prop_assert_eq!(marked, partial.is_empty());
        let any_failed = effects.iter().any(|e| matches!(e, RetryEffect::MarkFailed { .. }));
        prop_assert!(!any_failed);
    }
}
