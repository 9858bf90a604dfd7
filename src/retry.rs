//! Retry controller
//!
//! Wraps the stream consumer with a bounded, backed-off retry loop. The
//! decisions live in the pure `transition` function; this module only
//! executes the effects it returns.

mod transition;

#[cfg(test)]
mod proptests;

pub use transition::{
    transition, RetryEffect, RetryEvent, RetryState, TransitionError, TransitionResult,
};

use crate::consumer::{consume, AttemptOutcome, MessageSink};
use crate::conversation::{failed_content, retrying_marker, STOPPED_MARKER};
use crate::transport::{ChatRequest, ChatTransport, StreamError};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Attempt budget and backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A zero budget is raised to one attempt
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the failure of `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift)
    }
}

/// Bookkeeping for one user-initiated send
#[derive(Debug, Clone)]
pub struct RetrySession {
    pub target_message_id: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<StreamError>,
}

impl RetrySession {
    fn new(target_message_id: &str, policy: &RetryPolicy) -> Self {
        Self {
            target_message_id: target_message_id.to_string(),
            attempt_count: 0,
            max_attempts: policy.max_attempts,
            last_error: None,
        }
    }
}

/// Terminal result of a retry session
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    /// Full text of the successful attempt
    Success(String),
    Cancelled,
    /// Every attempt failed, or the failure was not retryable
    Failed { error: StreamError, message: String },
}

/// Result of `RetryController::run`
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub outcome: RetryOutcome,
    pub session: RetrySession,
}

/// Runs attempts against one target message until a terminal state
pub struct RetryController<'a, T: ?Sized> {
    transport: &'a T,
    sink: &'a dyn MessageSink,
    policy: RetryPolicy,
}

impl<'a, T> RetryController<'a, T>
where
    T: ChatTransport + ?Sized,
{
    pub fn new(transport: &'a T, sink: &'a dyn MessageSink, policy: RetryPolicy) -> Self {
        Self {
            transport,
            sink,
            policy,
        }
    }

    pub async fn run(
        &self,
        request: &ChatRequest,
        target_id: &str,
        token: &CancellationToken,
    ) -> RetryReport {
        let mut session = RetrySession::new(target_id, &self.policy);
        let mut state = RetryState::Idle;
        let mut events = VecDeque::from([RetryEvent::Start]);
        let mut success_text = String::new();

        while let Some(event) = events.pop_front() {
            let result = match transition(&state, &self.policy, event) {
                Ok(result) => result,
                Err(e) => {
                    // Unreachable with the events produced below; end the session
                    // rather than spin.
                    tracing::error!(message_id = %target_id, error = %e, "Retry transition rejected");
                    break;
                }
            };
            state = result.new_state;

            for effect in result.effects {
                let follow_up = self
                    .execute_effect(effect, request, target_id, token, &mut session, &mut success_text)
                    .await;
                events.extend(follow_up);
            }
        }

        let outcome = match state {
            RetryState::Success => RetryOutcome::Success(success_text),
            RetryState::Failed { message } => RetryOutcome::Failed {
                error: session
                    .last_error
                    .clone()
                    .unwrap_or_else(|| StreamError::protocol(message.clone())),
                message,
            },
            _ => RetryOutcome::Cancelled,
        };

        tracing::info!(
            message_id = %session.target_message_id,
            attempts = session.attempt_count,
            max_attempts = session.max_attempts,
            outcome = outcome.label(),
            "Retry session finished"
        );
        RetryReport { outcome, session }
    }

    async fn execute_effect(
        &self,
        effect: RetryEffect,
        request: &ChatRequest,
        target_id: &str,
        token: &CancellationToken,
        session: &mut RetrySession,
        success_text: &mut String,
    ) -> Option<RetryEvent> {
        match effect {
            RetryEffect::RunAttempt { attempt } => {
                if token.is_cancelled() {
                    return Some(RetryEvent::CancelObserved);
                }
                session.attempt_count = attempt;
                tracing::debug!(message_id = %target_id, attempt, "Starting attempt");

                match consume(self.transport, request, target_id, self.sink, token).await {
                    Ok(AttemptOutcome::Completed(text)) => {
                        *success_text = text;
                        Some(RetryEvent::AttemptSucceeded)
                    }
                    Ok(AttemptOutcome::Cancelled(partial)) => {
                        Some(RetryEvent::AttemptCancelled { partial })
                    }
                    Err(failure) => {
                        tracing::warn!(
                            message_id = %target_id,
                            attempt,
                            retryable = failure.error.is_retryable(),
                            error = %failure.error,
                            "Attempt failed"
                        );
                        let event = RetryEvent::AttemptFailed {
                            kind: failure.error.kind,
                            message: failure.error.message.clone(),
                            partial: failure.partial,
                        };
                        session.last_error = Some(failure.error);
                        Some(event)
                    }
                }
            }

            RetryEffect::ResetTarget => {
                self.sink.apply(target_id, "");
                None
            }

            RetryEffect::ShowRetrying {
                attempt,
                max_attempts,
            } => {
                self.sink
                    .apply(target_id, &retrying_marker(attempt, max_attempts));
                self.sink.retrying(target_id, attempt, max_attempts);
                None
            }

            RetryEffect::Backoff { delay } => {
                tracing::info!(message_id = %target_id, delay_ms = delay.as_millis(), "Backing off before retry");
                tokio::select! {
                    biased;

                    () = token.cancelled() => Some(RetryEvent::CancelObserved),

                    () = tokio::time::sleep(delay) => {
                        if token.is_cancelled() {
                            Some(RetryEvent::CancelObserved)
                        } else {
                            Some(RetryEvent::BackoffElapsed)
                        }
                    }
                }
            }

            RetryEffect::MarkStopped => {
                self.sink.apply(target_id, STOPPED_MARKER);
                None
            }

            RetryEffect::MarkFailed { partial } => {
                self.sink.apply(target_id, &failed_content(&partial));
                None
            }
        }
    }
}

impl RetryOutcome {
    fn label(&self) -> &'static str {
        match self {
            RetryOutcome::Success(_) => "success",
            RetryOutcome::Cancelled => "cancelled",
            RetryOutcome::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::FAILED_MARKER;
    use crate::testing::{chat_request, RecordingSink, Script, ScriptedTransport};
    use crate::transport::StreamErrorKind;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        // Huge attempt numbers saturate instead of overflowing
        assert!(policy.delay_for(u32::MAX) >= Duration::from_secs(1 << 16));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let transport = ScriptedTransport::new();
        transport.push(Script::Status(503));
        transport.push(Script::Status(503));
        transport.push(Script::chunks(&["0:\"third \"\n0:\"time\"\n"]));
        let sink = RecordingSink::new();
        let token = CancellationToken::new();

        let report = RetryController::new(&transport, &sink, fast_policy())
            .run(&chat_request("hi"), "ai-1", &token)
            .await;

        assert!(matches!(report.outcome, RetryOutcome::Success(ref t) if t == "third time"));
        assert_eq!(report.session.attempt_count, 3);
        assert_eq!(sink.last_for("ai-1").as_deref(), Some("third time"));
        assert_eq!(sink.retry_notices(), vec![(1, 3), (2, 3)]);
    }

    #[tokio::test]
    async fn exhausted_budget_marks_failure() {
        let transport = ScriptedTransport::new();
        for _ in 0..4 {
            transport.push(Script::Status(503));
        }
        let sink = RecordingSink::new();
        let token = CancellationToken::new();

        let report = RetryController::new(&transport, &sink, fast_policy())
            .run(&chat_request("hi"), "ai-1", &token)
            .await;

        match report.outcome {
            RetryOutcome::Failed { error, message } => {
                assert_eq!(error.kind, StreamErrorKind::Transient);
                assert!(message.starts_with("Failed after 3 attempts"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // No fourth attempt
        assert_eq!(transport.open_count(), 3);
        assert_eq!(sink.last_for("ai-1").as_deref(), Some(FAILED_MARKER));
    }

    #[tokio::test]
    async fn retry_discards_partial_text() {
        let transport = ScriptedTransport::new();
        transport.push(Script::ChunksThenError(vec!["0:\"dupli\"\n".into()]));
        transport.push(Script::chunks(&["0:\"clean\"\n"]));
        let sink = RecordingSink::new();
        let token = CancellationToken::new();

        let report = RetryController::new(&transport, &sink, fast_policy())
            .run(&chat_request("hi"), "ai-1", &token)
            .await;

        assert!(matches!(report.outcome, RetryOutcome::Success(ref t) if t == "clean"));
        // Text from the failed attempt is cleared before the marker, and the
        // marker is cleared once the next stream opens
        assert_eq!(
            sink.contents_for("ai-1"),
            vec![
                String::new(),
                "dupli".to_string(),
                String::new(),
                retrying_marker(1, 3),
                String::new(),
                "clean".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn partial_text_survives_exhaustion() {
        let transport = ScriptedTransport::new();
        transport.push(Script::ChunksThenError(vec!["0:\"half\"\n".into()]));
        let sink = RecordingSink::new();
        let token = CancellationToken::new();

        let report = RetryController::new(&transport, &sink, RetryPolicy::new(1, Duration::ZERO))
            .run(&chat_request("hi"), "ai-1", &token)
            .await;

        assert!(matches!(report.outcome, RetryOutcome::Failed { .. }));
        assert_eq!(
            sink.last_for("ai-1"),
            Some(format!("half\n\n{FAILED_MARKER}"))
        );
    }

    #[tokio::test]
    async fn fatal_status_is_not_retried() {
        let transport = ScriptedTransport::new();
        transport.push(Script::Status(400));
        transport.push(Script::chunks(&["0:\"unused\"\n"]));
        let sink = RecordingSink::new();
        let token = CancellationToken::new();

        let report = RetryController::new(&transport, &sink, fast_policy())
            .run(&chat_request("hi"), "ai-1", &token)
            .await;

        assert!(matches!(report.outcome, RetryOutcome::Failed { .. }));
        assert_eq!(transport.open_count(), 1);
        assert!(sink.retry_notices().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_session() {
        let transport = ScriptedTransport::new();
        transport.push(Script::Status(503));
        transport.push(Script::chunks(&["0:\"unused\"\n"]));
        let sink = RecordingSink::new();
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let report = RetryController::new(
            &transport,
            &sink,
            RetryPolicy::new(3, Duration::from_secs(30)),
        )
        .run(&chat_request("hi"), "ai-1", &token)
        .await;
        canceller.await.unwrap();

        assert!(matches!(report.outcome, RetryOutcome::Cancelled));
        assert_eq!(transport.open_count(), 1);
        assert_eq!(sink.last_for("ai-1").as_deref(), Some(STOPPED_MARKER));
    }

    #[tokio::test]
    async fn cancelled_mid_stream_keeps_text() {
        let transport = ScriptedTransport::new();
        let token = CancellationToken::new();
        transport.push(Script::CancelAfter {
            chunks: vec!["0:\"kept\"\n".into(), "0:\" dropped\"\n".into()],
            after: 2,
            token: token.clone(),
        });
        let sink = RecordingSink::new();

        let report = RetryController::new(&transport, &sink, fast_policy())
            .run(&chat_request("hi"), "ai-1", &token)
            .await;

        assert!(matches!(report.outcome, RetryOutcome::Cancelled));
        assert_eq!(sink.last_for("ai-1").as_deref(), Some("kept"));
        assert_eq!(transport.open_count(), 1);
    }
}
