//! Pure retry state transitions
//!
//! `transition` has no I/O: given a state and an event it returns the next
//! state and the effects the executor must carry out.

use super::RetryPolicy;
use crate::transport::StreamErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Retry session states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    /// Waiting out the backoff before `next_attempt`
    Retrying { next_attempt: u32 },
    Success,
    Cancelled,
    Failed { message: String },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Success | RetryState::Cancelled | RetryState::Failed { .. }
        )
    }
}

/// Events that drive the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    Start,
    AttemptSucceeded,
    AttemptFailed {
        kind: StreamErrorKind,
        message: String,
        partial: String,
    },
    /// The consumer observed cancellation mid-attempt
    AttemptCancelled { partial: String },
    /// The controller observed cancellation outside an attempt
    CancelObserved,
    BackoffElapsed,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEffect {
    RunAttempt { attempt: u32 },
    /// Discard text from the failed attempt
    ResetTarget,
    ShowRetrying { attempt: u32, max_attempts: u32 },
    Backoff { delay: Duration },
    MarkStopped,
    MarkFailed { partial: String },
}

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: RetryState,
    pub effects: Vec<RetryEffect>,
}

impl TransitionResult {
    pub fn new(state: RetryState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: RetryEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Retry session already finished ({0:?})")]
    Finished(RetryState),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

pub fn transition(
    state: &RetryState,
    policy: &RetryPolicy,
    event: RetryEvent,
) -> Result<TransitionResult, TransitionError> {
    if state.is_terminal() {
        return Err(TransitionError::Finished(state.clone()));
    }

    match (state, event) {
        (RetryState::Idle, RetryEvent::Start) => {
            Ok(TransitionResult::new(RetryState::Attempting { attempt: 1 })
                .with_effect(RetryEffect::RunAttempt { attempt: 1 }))
        }

        (RetryState::Attempting { .. }, RetryEvent::AttemptSucceeded) => {
            Ok(TransitionResult::new(RetryState::Success))
        }

        // Text already shown stays; an empty message gets the stopped marker
        (RetryState::Attempting { .. }, RetryEvent::AttemptCancelled { partial }) => {
            let result = TransitionResult::new(RetryState::Cancelled);
            if partial.is_empty() {
                Ok(result.with_effect(RetryEffect::MarkStopped))
            } else {
                Ok(result)
            }
        }

        (RetryState::Attempting { attempt }, RetryEvent::AttemptFailed { kind, .. })
            if kind.is_retryable() && *attempt < policy.max_attempts =>
        {
            Ok(TransitionResult::new(RetryState::Retrying {
                next_attempt: attempt + 1,
            })
            .with_effect(RetryEffect::ResetTarget)
            .with_effect(RetryEffect::ShowRetrying {
                attempt: *attempt,
                max_attempts: policy.max_attempts,
            })
            .with_effect(RetryEffect::Backoff {
                delay: policy.delay_for(*attempt),
            }))
        }

        (RetryState::Attempting { attempt }, RetryEvent::AttemptFailed { kind, message, partial }) => {
            let message = if kind.is_retryable() {
                format!("Failed after {attempt} attempts: {message}")
            } else {
                message
            };
            Ok(TransitionResult::new(RetryState::Failed { message })
                .with_effect(RetryEffect::MarkFailed { partial }))
        }

        (RetryState::Retrying { next_attempt }, RetryEvent::BackoffElapsed) => {
            Ok(TransitionResult::new(RetryState::Attempting {
                attempt: *next_attempt,
            })
            .with_effect(RetryEffect::RunAttempt {
                attempt: *next_attempt,
            }))
        }

        (
            RetryState::Idle | RetryState::Attempting { .. } | RetryState::Retrying { .. },
            RetryEvent::CancelObserved,
        ) => Ok(TransitionResult::new(RetryState::Cancelled).with_effect(RetryEffect::MarkStopped)),

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{event:?} in state {state:?}"
        ))),
    }
}
