//! Error types and error handling for the application
//!
//! This module defines custom error types that can be converted to HTTP responses.
//! All errors implement `IntoResponse` to provide consistent error formatting.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::completion::CompletionError;

/// Application-level error types
///
/// All errors that can occur in the application are represented by this enum.
/// Each variant implements automatic conversion to HTTP responses via `IntoResponse`.
#[derive(Error, Debug)]
pub enum AppError {
    /// User with the given ID was not found
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Conversation with the given ID was not found or is not owned by the caller
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Username or email is already taken
    #[error("Username or email already exists: {0}")]
    DuplicateUser(String),

    /// Login credentials did not match a known user
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Request payload failed validation
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Session token could not be resolved to a user
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Completion provider call failed
    #[error("Completion provider error: {0}")]
    Completion(#[from] CompletionError),

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::UserNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::ConversationNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::DuplicateUser(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Auth(inner) => match inner {
                AuthError::WeakPassword(_) => (StatusCode::BAD_REQUEST, self.to_string()),
                AuthError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
                _ => (StatusCode::UNAUTHORIZED, self.to_string()),
            },
            AppError::Completion(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
