//! HTTP API for Kacademyx
//!
//! The chat streaming endpoint the client consumes. It proxies an
//! OpenAI-compatible completion stream and re-encodes it in the line
//! protocol.

mod handlers;
mod upstream;

pub use handlers::create_router;
pub use upstream::UpstreamClient;

use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self {
            upstream: Arc::new(upstream),
        }
    }
}
