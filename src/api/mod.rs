//! HTTP API
//!
//! Request handlers for account and conversation management, plus the shared
//! state and the bearer-token extractor every protected handler uses.

pub mod chat;
pub mod users;

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
    response::Json,
    routing::{get, post, put},
    Router,
};

use crate::auth::{self, AuthError, AuthenticatedUser};
use crate::db::ChatDb;
use crate::error::AppError;
use crate::ws::ChatGateway;

/// Shared state threaded through every handler
#[derive(Clone)]
pub struct ApiState {
    /// Persistence layer
    pub db: Arc<ChatDb>,
    /// Realtime gateway, for the WebSocket handshake route
    pub gateway: Arc<ChatGateway>,
    /// Secret used to sign and verify session tokens
    pub jwt_secret: String,
    /// Session token lifetime in hours
    pub token_ttl_hours: i64,
}

#[async_trait]
impl FromRequestParts<ApiState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(auth::bearer_token)
            .ok_or(AuthError::MissingToken)?;

        Ok(auth::authenticate(&state.db, &state.jwt_secret, token).await?)
    }
}

/// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "chat-backend"
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::completion::{ChatMessage, CompletionError, CompletionProvider};
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Provider that immediately ends the stream; handler tests never reach it
    struct NullProvider;

    #[async_trait]
    impl CompletionProvider for NullProvider {
        async fn stream_completion(
            &self,
            _history: Vec<ChatMessage>,
        ) -> Result<mpsc::Receiver<Result<String, CompletionError>>, CompletionError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    pub(crate) async fn create_test_state() -> (ApiState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(
            ChatDb::new(db_path.to_str().unwrap())
                .await
                .expect("Failed to create test database"),
        );
        let gateway = ChatGateway::new(db.clone(), Arc::new(NullProvider));
        let state = ApiState {
            db,
            gateway,
            jwt_secret: "test-secret-key-must-be-at-least-32-chars!".to_string(),
            token_ttl_hours: 24,
        };
        (state, temp_dir)
    }
}

/// Build the application router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/auth/signup", post(users::signup))
        .route("/api/auth/login", post(users::login))
        .route("/api/auth/me", get(users::current_user))
        .route("/api/users/:id", get(users::get_user))
        .route(
            "/api/chat/conversations",
            get(chat::list_conversations).post(chat::create_conversation),
        )
        .route(
            "/api/chat/conversations/:id",
            get(chat::get_conversation).delete(chat::delete_conversation),
        )
        .route(
            "/api/chat/conversations/:id/title",
            put(chat::update_conversation_title),
        )
        .route(
            "/api/chat/conversations/:id/messages",
            get(chat::list_messages),
        )
        .route("/ws", get(crate::ws::websocket_handler))
        .with_state(state)
}
