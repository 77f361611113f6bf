//! Realtime layer
//!
//! WebSocket handshake plus the gateway that owns live connections. The
//! handshake authenticates before the protocol upgrade, so an unauthorized
//! client is refused with a plain HTTP error and never reaches the gateway.

pub mod events;
pub mod gateway;

pub use gateway::{ChatGateway, ConnectionId};

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use serde::Deserialize;
use tracing::warn;

use crate::api::ApiState;
use crate::auth::{self, AuthError};
use crate::error::AppError;

/// Handshake query parameters
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session token; an Authorization bearer header is accepted as fallback
    #[serde(default)]
    pub token: Option<String>,
}

/// WebSocket upgrade handler
///
/// Authenticates the session token before upgrading. Browsers cannot set
/// headers on WebSocket requests, so the token travels in the query string;
/// a bearer header works too for non-browser clients.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> Result<Response, AppError> {
    let token = query
        .token
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(auth::bearer_token)
                .map(str::to_string)
        })
        .ok_or(AuthError::MissingToken)?;

    let user = auth::authenticate(&state.db, &state.jwt_secret, &token)
        .await
        .map_err(|e| {
            warn!(error = %e, "Rejected WebSocket handshake");
            e
        })?;

    let gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| gateway.handle_connection(socket, user)))
}
