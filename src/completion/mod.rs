//! Completion provider abstraction
//!
//! The gateway consumes AI responses as a lazy sequence of text fragments:
//! each received item is the next fragment, an `Err` item is an upstream
//! failure, and a closed channel is end-of-stream. The gateway's job is to
//! drain the sequence while re-broadcasting; iteration control is never
//! exposed to clients.

pub mod openai;

pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Fixed system instruction prepended to every completion request
pub const SYSTEM_PROMPT: &str =
    "Only ever reply with 3 lines maximum. Keep your responses concise and helpful.";

/// A role-tagged message in a completion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender role: "system", "user" or "assistant"
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Build a system-role message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Build a user-role message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Errors that can occur while requesting or streaming a completion
#[derive(Error, Debug)]
pub enum CompletionError {
    /// No API key is configured; the provider cannot be called
    #[error("completion API key is not configured")]
    MissingApiKey,

    /// The HTTP request could not be sent
    #[error("completion request failed: {0}")]
    Request(String),

    /// The provider returned a non-success status
    #[error("completion API returned status {status}: {body}")]
    Api {
        /// HTTP status code returned by the provider
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// The stream broke or produced undecodable data mid-response
    #[error("completion stream error: {0}")]
    Stream(String),
}

/// A streaming text-completion service
///
/// Implementations send each text fragment through the returned channel in
/// arrival order and close it on completion; a fragment-level failure is
/// delivered as an `Err` item before the channel closes.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Start a streaming completion for the given ordered message history
    async fn stream_completion(
        &self,
        history: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, CompletionError>>, CompletionError>;
}
