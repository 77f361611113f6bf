//! Conversation API endpoints
//!
//! Owner-scoped CRUD for conversations and message history. Every lookup
//! goes through the owner-scoped query, so another user's conversation is
//! indistinguishable from a missing one.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiState;
use crate::auth::AuthenticatedUser;
use crate::db::Conversation;
use crate::error::AppError;

/// Request to create a new conversation
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    /// Optional title; defaults to "New Chat"
    pub title: Option<String>,
}

/// Request to update a conversation title
#[derive(Debug, Deserialize)]
pub struct UpdateTitleRequest {
    /// New title
    pub title: String,
}

/// Conversation response
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    /// Conversation unique identifier
    pub id: String,
    /// Conversation title
    pub title: String,
    /// Unix timestamp when conversation was created
    pub created_at: i64,
    /// Unix timestamp when conversation was last updated
    pub updated_at: i64,
}

/// Message response
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Message unique identifier
    pub id: String,
    /// ID of the conversation this message belongs to
    pub conversation_id: String,
    /// Message role ("user" or "assistant")
    pub role: String,
    /// Message content
    pub content: String,
    /// Unix timestamp when message was created
    pub created_at: i64,
}

/// Conversation with messages response
#[derive(Debug, Serialize)]
pub struct ConversationWithMessagesResponse {
    /// The conversation
    pub conversation: ConversationResponse,
    /// List of messages in the conversation
    pub messages: Vec<MessageResponse>,
}

impl From<Conversation> for ConversationResponse {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            title: c.title,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

impl From<crate::db::Message> for MessageResponse {
    fn from(m: crate::db::Message) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            role: m.role,
            content: m.content,
            created_at: m.created_at,
        }
    }
}

/// GET /api/chat/conversations - List the caller's conversations
pub async fn list_conversations(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<ConversationResponse>>, AppError> {
    let conversations = state.db.get_conversations_for_user(&user.id).await?;

    Ok(Json(
        conversations.into_iter().map(Into::into).collect(),
    ))
}

/// POST /api/chat/conversations - Create a new conversation
pub async fn create_conversation(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateConversationRequest>,
) -> Result<Json<ConversationResponse>, AppError> {
    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New Chat".to_string());

    let conversation = Conversation::new(Uuid::new_v4().to_string(), user.id.clone(), title);
    state.db.create_conversation(&conversation).await?;

    Ok(Json(conversation.into()))
}

/// GET /api/chat/conversations/:id - Get a conversation with its messages
pub async fn get_conversation(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithMessagesResponse>, AppError> {
    let conversation = state
        .db
        .get_user_conversation(&id, &user.id)
        .await?
        .ok_or_else(|| AppError::ConversationNotFound(id.clone()))?;

    let messages = state.db.get_messages(&id).await?;

    Ok(Json(ConversationWithMessagesResponse {
        conversation: conversation.into(),
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

/// GET /api/chat/conversations/:id/messages - Get a conversation's messages
pub async fn list_messages(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageResponse>>, AppError> {
    state
        .db
        .get_user_conversation(&id, &user.id)
        .await?
        .ok_or_else(|| AppError::ConversationNotFound(id.clone()))?;

    let messages = state.db.get_messages(&id).await?;

    Ok(Json(messages.into_iter().map(Into::into).collect()))
}

/// PUT /api/chat/conversations/:id/title - Update a conversation title
pub async fn update_conversation_title(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateTitleRequest>,
) -> Result<Json<ConversationResponse>, AppError> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Title cannot be empty".to_string()));
    }

    state
        .db
        .get_user_conversation(&id, &user.id)
        .await?
        .ok_or_else(|| AppError::ConversationNotFound(id.clone()))?;

    state.db.rename_conversation(&id, title).await?;

    let conversation = state
        .db
        .get_conversation(&id)
        .await?
        .ok_or_else(|| AppError::ConversationNotFound(id.clone()))?;

    Ok(Json(conversation.into()))
}

/// DELETE /api/chat/conversations/:id - Delete a conversation
pub async fn delete_conversation(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .db
        .get_user_conversation(&id, &user.id)
        .await?
        .ok_or_else(|| AppError::ConversationNotFound(id.clone()))?;

    state.db.delete_conversation(&id).await?;

    Ok(Json(serde_json::json!({
        "message": "Conversation deleted successfully",
        "id": id
    })))
}
