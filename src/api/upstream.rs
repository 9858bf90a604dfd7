//! OpenAI-compatible upstream and the SSE to line-protocol relay

use crate::config::ServerConfig;
use crate::decoder::CONTENT_PREFIX;
use crate::transport::{ChatRequest, TRANSIENT_STATUS_CODES};
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::{future, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const UPSTREAM_DONE: &str = "[DONE]";
const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 4000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Used when the client sends no system instruction of its own
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Kacademyx, an AI tutor focused on depth, accuracy and completeness.

Match the depth of your answer to the question:
1. For a simple or factual question (\"What is 2+2?\", \"Capital of France\"), answer directly and concisely without over-explaining.
2. For a complex or open-ended request (\"Explain quantum mechanics\", \"Write a full essay\"):
   - Plan inside <thinking>...</thinking> tags first: how deep to go, which sub-topics to cover, how to structure the answer.
   - Then give a thorough, well-structured answer at expert level.
   - Use Markdown (headers, lists, bold) for readability.

Aim to be the best possible learning resource for what the student actually asked.";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HF API key missing")]
    MissingKey,
    #[error("Failed to create HTTP client: {0}")]
    Client(String),
    #[error("Upstream unreachable: {0}")]
    Unreachable(String),
    #[error("Upstream error: {status} {body}")]
    Status { status: u16, body: String },
}

impl UpstreamError {
    /// Worth a retry by the client
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Unreachable(_) => true,
            UpstreamError::Status { status, .. } => TRANSIENT_STATUS_CODES.contains(status),
            UpstreamError::MissingKey | UpstreamError::Client(_) => false,
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<UpstreamMessage<'a>>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct UpstreamMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

/// Streams chat completions from the upstream provider
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: &ServerConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.upstream_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Start a streaming completion; returns the raw SSE body
    pub async fn open(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, UpstreamError> {
        let api_key = self.api_key.as_deref().ok_or(UpstreamError::MissingKey)?;

        let system = if request.system.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            request.system.as_str()
        };
        let messages = std::iter::once(UpstreamMessage {
            role: "system",
            content: system,
        })
        .chain(request.messages.iter().map(|m| UpstreamMessage {
            role: m.role.as_str(),
            content: &m.content,
        }))
        .collect();

        let payload = CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        tracing::info!(
            model = %self.model,
            messages = request.messages.len(),
            "Forwarding chat to upstream"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "Upstream returned error status");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes_stream().boxed())
    }
}

/// Encode one content delta as a protocol line
pub fn encode_delta(text: &str) -> String {
    format!(
        "{CONTENT_PREFIX}{}\n",
        serde_json::Value::String(text.to_string())
    )
}

/// Content of the first choice, if the event carries any
fn delta_content(data: &str) -> Option<String> {
    match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty()),
        Err(e) => {
            tracing::warn!(error = %e, data = %data, "Skipping unparsable upstream event");
            None
        }
    }
}

/// Re-encode an upstream SSE body as protocol lines.
///
/// Events that fail to parse are skipped. `[DONE]` ends the output. A
/// transport error is passed on so the response body aborts.
pub fn relay<S, B, E>(body: S) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    body.eventsource()
        .take_while(|event| {
            future::ready(!matches!(event, Ok(event) if event.data.trim() == UPSTREAM_DONE))
        })
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => {
                    delta_content(&event.data).map(|content| Ok(Bytes::from(encode_delta(&content))))
                }
                Err(EventStreamError::Transport(e)) => {
                    tracing::error!(error = %e, "Upstream stream broke");
                    Some(Err(std::io::Error::other(format!("upstream stream broke: {e}"))))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed upstream event");
                    None
                }
            })
        })
}
