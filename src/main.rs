//! Chat Backend
//!
//! A REST API and WebSocket server for a conversational AI chat application.
//! Provides account and conversation endpoints plus realtime rooms with
//! streamed AI responses.

use axum::{extract::Request, middleware::Next, response::Response};
use chat_backend::api::{self, ApiState};
use chat_backend::completion::OpenAiProvider;
use chat_backend::config::Config;
use chat_backend::db::ChatDb;
use chat_backend::ws::gateway;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Request ID middleware - adds unique ID to each request for tracing
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    let response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status().as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!("Configuration loaded: {:?}", config);

    let db = Arc::new(ChatDb::new(&config.database.path).await?);

    if config.openai.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; AI turns will fail until it is configured");
    }
    let provider = Arc::new(OpenAiProvider::new(
        config.openai.api_key.clone(),
        config.openai.model.clone(),
        config.openai.base_url.clone(),
    ));

    // Install the process-wide gateway before accepting any connection
    let chat_gateway = gateway::ChatGateway::new(db.clone(), provider);
    gateway::install(chat_gateway.clone())?;

    let state = ApiState {
        db,
        gateway: chat_gateway,
        jwt_secret: config.auth.jwt_secret.clone(),
        token_ttl_hours: config.auth.token_ttl_hours,
    };

    // Build our application with routes
    // Middleware (order matters - request_id should be first)
    let app = api::router(state)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(CorsLayer::permissive()); // Allow CORS for development

    // Bind to address from config
    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    info!("🚀 Server running on http://{}", addr);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Setup graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
