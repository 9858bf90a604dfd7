//! Kacademyx - streaming AI tutor chat
//!
//! `kacademyx serve` runs the chat streaming endpoint in front of an
//! OpenAI-compatible provider. `kacademyx chat` (the default) is the
//! terminal client that talks to it.

mod api;
mod cli;
mod config;
mod consumer;
mod conversation;
mod db;
mod decoder;
mod orchestrator;
mod retry;
mod settings;
mod store;
mod transport;

#[cfg(test)]
mod testing;

use api::{create_router, AppState, UpstreamClient};
use config::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: kacademyx [serve | chat]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);
    match command.as_deref() {
        Some("serve") => serve().await,
        None | Some("chat") => chat().await,
        Some("-h" | "--help" | "help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => Err(format!("unknown command {other:?}; {USAGE}").into()),
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(env_filter("kacademyx=info,tower_http=debug"))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = ServerConfig::from_env();
    if config.api_key.is_none() {
        tracing::warn!("No API key configured. Set HUGGINGFACE_API_KEY or HF_TOKEN.");
    }
    let upstream = UpstreamClient::new(&config)?;
    tracing::info!(model = %upstream.model(), upstream = %config.upstream_url, "Upstream configured");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(upstream))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Kacademyx server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn chat() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they stay out of the conversation
    tracing_subscriber::registry()
        .with(env_filter("kacademyx=warn"))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .init();

    cli::run(ClientConfig::from_env()).await
}
