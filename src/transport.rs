//! Transport to the chat streaming endpoint
//!
//! The stream consumer only sees `ChatTransport`, so attempts can be driven
//! by scripted streams in tests.

mod error;
mod http;

pub use error::{StreamError, StreamErrorKind, TRANSIENT_STATUS_CODES};
pub use http::HttpTransport;

use crate::conversation::OutgoingMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body chunks of an open response
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Request body for the chat endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<OutgoingMessage>,
    #[serde(default)]
    pub system: String,
}

/// Opens streaming chat completions
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send the request and return the body stream once a success status
    /// has been received. Non-success statuses are classified errors.
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError>;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError> {
        (**self).open(request).await
    }
}
