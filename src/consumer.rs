//! Stream consumer: one network attempt
//!
//! Opens the chat stream, feeds body chunks to the decoder and applies the
//! growing text to the target message. Every suspension point races the
//! cancellation token, and the token is checked again before any mutation.

use crate::decoder::LineDecoder;
use crate::transport::{ChatRequest, ChatTransport, StreamError};
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Receives message content updates from the streaming pipeline
pub trait MessageSink: Send + Sync {
    /// Replace the displayed content of `message_id` with a full snapshot
    fn apply(&self, message_id: &str, content: &str);

    /// A retry of `message_id` has been scheduled
    fn retrying(&self, _message_id: &str, _attempt: u32, _max_attempts: u32) {}
}

/// State owned by a single attempt; never reused across retries
#[derive(Debug)]
pub struct StreamAttempt {
    token: CancellationToken,
    accumulated: String,
    decoder: LineDecoder,
}

impl StreamAttempt {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            accumulated: String::new(),
            decoder: LineDecoder::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Decode a chunk and apply one snapshot per delta
    fn ingest(&mut self, chunk: &[u8], target_id: &str, sink: &dyn MessageSink) {
        for delta in self.decoder.feed(chunk) {
            self.push_delta(&delta, target_id, sink);
        }
    }

    fn flush(&mut self, target_id: &str, sink: &dyn MessageSink) {
        for delta in self.decoder.finish() {
            self.push_delta(&delta, target_id, sink);
        }
    }

    fn push_delta(&mut self, delta: &str, target_id: &str, sink: &dyn MessageSink) {
        self.accumulated.push_str(delta);
        sink.apply(target_id, &self.accumulated);
    }

    fn into_text(self) -> String {
        self.accumulated
    }
}

/// How an attempt ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Stream reached its end; carries the full text
    Completed(String),
    /// Cancellation was observed; carries the text applied so far
    Cancelled(String),
}

/// A failed attempt together with whatever text it had already applied
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AttemptFailure {
    pub error: StreamError,
    pub partial: String,
}

impl AttemptFailure {
    fn before_stream(error: StreamError) -> Self {
        Self {
            error,
            partial: String::new(),
        }
    }
}

/// Run exactly one attempt against the transport
pub async fn consume<T>(
    transport: &T,
    request: &ChatRequest,
    target_id: &str,
    sink: &dyn MessageSink,
    token: &CancellationToken,
) -> Result<AttemptOutcome, AttemptFailure>
where
    T: ChatTransport + ?Sized,
{
    let opened = tokio::select! {
        biased;

        () = token.cancelled() => {
            tracing::info!(message_id = %target_id, "Attempt cancelled before the stream opened");
            return Ok(AttemptOutcome::Cancelled(String::new()));
        }

        opened = transport.open(request) => opened,
    };

    let mut stream = opened.map_err(AttemptFailure::before_stream)?;
    let mut attempt = StreamAttempt::new(token.clone());

    if attempt.is_cancelled() {
        return Ok(AttemptOutcome::Cancelled(attempt.into_text()));
    }

    // Streaming has started: drop any marker left by an earlier attempt
    sink.apply(target_id, "");
    tracing::debug!(message_id = %target_id, "Chat stream opened");

    let mut chunks = 0usize;
    loop {
        let read = tokio::select! {
            biased;

            () = token.cancelled() => None,

            next = stream.next() => Some(next),
        };

        // Nothing is applied once cancellation has been requested
        let next = match read {
            Some(next) if !attempt.is_cancelled() => next,
            _ => {
                let text = attempt.into_text();
                tracing::info!(message_id = %target_id, chars = text.len(), "Stream cancelled");
                return Ok(AttemptOutcome::Cancelled(text));
            }
        };

        match next {
            Some(Ok(bytes)) => {
                chunks += 1;
                attempt.ingest(&bytes, target_id, sink);
            }
            Some(Err(error)) => {
                tracing::warn!(message_id = %target_id, error = %error, "Stream broke mid-response");
                return Err(AttemptFailure {
                    error,
                    partial: attempt.into_text(),
                });
            }
            None => break,
        }
    }

    attempt.flush(target_id, sink);
    tracing::debug!(
        message_id = %target_id,
        chunks,
        malformed = attempt.decoder.malformed_count(),
        "Chat stream finished"
    );
    Ok(AttemptOutcome::Completed(attempt.into_text()))
}
