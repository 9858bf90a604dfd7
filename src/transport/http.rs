//! reqwest-backed transport

use super::{ByteStream, ChatRequest, ChatTransport, StreamError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Streams completions from an HTTP chat endpoint
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// Only the connect phase is bounded; a healthy stream may legitimately
    /// run for minutes.
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self, StreamError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::protocol(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream, StreamError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %body, "Chat endpoint returned error status");
            return Err(StreamError::from_status(status.as_u16(), body.trim()));
        }

        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(StreamError::protocol("No response body").with_status(status.as_u16()));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::network(format!("Stream read failed: {e}"))));
        Ok(stream.boxed())
    }
}

fn classify_send_error(err: &reqwest::Error) -> StreamError {
    if err.is_builder() {
        StreamError::protocol(format!("Invalid request: {err}"))
    } else if err.is_timeout() {
        StreamError::network(format!("Request timed out: {err}"))
    } else if err.is_connect() {
        StreamError::network(format!("Connection failed: {err}"))
    } else {
        StreamError::network(format!("Request failed: {err}"))
    }
}
