//! Chat data models
//!
//! Defines structures for users, conversations and messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user
    User,
    /// Message from the assistant/AI
    Assistant,
}

impl MessageRole {
    /// Convert the role to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl From<&str> for MessageRole {
    fn from(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

/// A registered user
///
/// The password hash never leaves the persistence layer; API responses use
/// the reduced view from the handlers instead.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    /// Unique identifier for the user
    pub id: String,
    /// Unique login/display name
    pub username: String,
    /// Unique email address
    pub email: String,
    /// Argon2 hash of the user's password
    pub password_hash: String,
    /// When the user was created (Unix timestamp)
    pub created_at: i64,
    /// When the user was last updated (Unix timestamp)
    pub updated_at: i64,
}

impl User {
    /// Create a new user with an already-hashed password
    pub fn new(id: String, username: String, email: String, password_hash: String) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id,
            username,
            email,
            password_hash,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A conversation thread owned by a single user
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    /// Unique identifier for the conversation
    pub id: String,
    /// ID of the user who owns this conversation
    pub user_id: String,
    /// Title of the conversation
    pub title: String,
    /// When the conversation was created (Unix timestamp)
    pub created_at: i64,
    /// When the conversation was last updated (Unix timestamp)
    pub updated_at: i64,
}

impl Conversation {
    /// Create a new conversation
    pub fn new(id: String, user_id: String, title: String) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id,
            user_id,
            title,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Unique identifier for the message
    pub id: String,
    /// ID of the conversation this message belongs to
    pub conversation_id: String,
    /// Role of the message sender
    pub role: String, // Stored as "user" or "assistant" in DB
    /// Content of the message
    pub content: String,
    /// When the message was created (Unix timestamp)
    pub created_at: i64,
}

impl Message {
    /// Create a new message
    pub fn new(id: String, conversation_id: String, role: MessageRole, content: String) -> Self {
        Self {
            id,
            conversation_id,
            role: role.as_str().to_string(),
            content,
            created_at: Utc::now().timestamp(),
        }
    }

}
