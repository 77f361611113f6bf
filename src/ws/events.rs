//! Realtime wire events
//!
//! Typed event contract between clients and the gateway. Every frame is a
//! JSON object tagged with `type`; payload fields use camelCase to match
//! the browser client.

use serde::{Deserialize, Serialize};

use crate::db::Message;

/// Events a client sends to the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join the broadcast room for a conversation
    JoinConversation {
        /// Conversation to join
        conversation_id: String,
    },
    /// Leave the broadcast room for a conversation
    LeaveConversation {
        /// Conversation to leave
        conversation_id: String,
    },
    /// Send a chat message and trigger an AI turn
    SendMessage {
        /// Target conversation
        conversation_id: String,
        /// Message text
        message: String,
        /// Optional client-asserted user id; must match the authenticated
        /// identity when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// The user started typing in a conversation
    TypingStart {
        /// Conversation being typed in
        conversation_id: String,
    },
    /// The user stopped typing in a conversation
    TypingStop {
        /// Conversation being typed in
        conversation_id: String,
    },
}

/// Machine-readable error codes for scoped `error` events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Conversation does not exist or is not owned by the caller
    ConversationAccessDenied,
    /// Message text was empty or whitespace-only
    EmptyMessage,
    /// Event payload was malformed or missing required fields
    MissingRequiredFields,
    /// Unexpected failure while processing a message
    MessageProcessingError,
    /// Client-asserted user id did not match the authenticated identity
    UserIdMismatch,
}

/// Events the gateway sends to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Handshake succeeded; sent to the new connection only
    AuthSuccess {
        /// Authenticated user id
        user_id: String,
        /// Authenticated username
        username: String,
        /// Authenticated email
        email: String,
    },
    /// The connection joined a conversation room
    ConversationJoined {
        /// Conversation that was joined
        conversation_id: String,
    },
    /// The connection left a conversation room
    ConversationLeft {
        /// Conversation that was left
        conversation_id: String,
    },
    /// A scoped operation failure; the connection stays alive
    Error {
        /// Human-readable diagnostic
        message: String,
        /// Machine-readable code
        code: ErrorCode,
    },
    /// A user message was persisted and fanned out to the room
    MessageReceived {
        /// Persisted message id
        id: String,
        /// Message text
        content: String,
        /// Always "user"
        role: String,
        /// Conversation the message belongs to
        conversation_id: String,
        /// Persisted creation time (Unix timestamp)
        created_at: i64,
    },
    /// AI typing indicator for the room
    AiTyping {
        /// Whether the assistant is currently generating
        is_typing: bool,
    },
    /// One streamed fragment of the assistant response
    AiResponseChunk {
        /// Fragment text
        content: String,
        /// Always false while streaming
        is_complete: bool,
        /// Unset until the assistant message is persisted
        message_id: Option<String>,
    },
    /// The assistant response was persisted in full
    AiResponseComplete {
        /// Persisted message id
        id: String,
        /// Full response text
        content: String,
        /// Always "assistant"
        role: String,
        /// Conversation the message belongs to
        conversation_id: String,
        /// Persisted creation time (Unix timestamp)
        created_at: i64,
    },
    /// The AI turn failed; the typing indicator is reset separately
    AiResponseError {
        /// Human-readable diagnostic
        message: String,
        /// Underlying error text
        error: String,
    },
    /// Another user's typing indicator
    UserTyping {
        /// Typing user's id
        user_id: String,
        /// Typing user's name
        username: String,
        /// Whether the user is currently typing
        is_typing: bool,
    },
}

impl ServerEvent {
    /// Build a scoped error event
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            code,
        }
    }

    /// Build a `message_received` event from a persisted message
    pub fn message_received(message: &Message) -> Self {
        ServerEvent::MessageReceived {
            id: message.id.clone(),
            content: message.content.clone(),
            role: message.role.clone(),
            conversation_id: message.conversation_id.clone(),
            created_at: message.created_at,
        }
    }

    /// Build an `ai_response_complete` event from a persisted message
    pub fn ai_response_complete(message: &Message) -> Self {
        ServerEvent::AiResponseComplete {
            id: message.id.clone(),
            content: message.content.clone(),
            role: message.role.clone(),
            conversation_id: message.conversation_id.clone(),
            created_at: message.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_names() {
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "send_message",
            "conversationId": "c1",
            "message": "hello",
        }))
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                conversation_id: "c1".to_string(),
                message: "hello".to_string(),
                user_id: None,
            }
        );

        let joined = serde_json::to_value(ClientEvent::JoinConversation {
            conversation_id: "c1".to_string(),
        })
        .unwrap();
        assert_eq!(joined["type"], "join_conversation");
        assert_eq!(joined["conversationId"], "c1");
    }

    #[test]
    fn test_client_event_missing_fields_fail() {
        let result: Result<ClientEvent, _> = serde_json::from_value(json!({
            "type": "send_message",
            "message": "hello",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_error_code_wire_names() {
        let event = ServerEvent::error(ErrorCode::ConversationAccessDenied, "denied");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "CONVERSATION_ACCESS_DENIED");

        let value =
            serde_json::to_value(ServerEvent::error(ErrorCode::EmptyMessage, "empty")).unwrap();
        assert_eq!(value["code"], "EMPTY_MESSAGE");
    }

    #[test]
    fn test_server_event_payload_casing() {
        let chunk = ServerEvent::AiResponseChunk {
            content: "Hi".to_string(),
            is_complete: false,
            message_id: None,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "ai_response_chunk");
        assert_eq!(value["isComplete"], false);
        assert!(value["messageId"].is_null());

        let typing = ServerEvent::AiTyping { is_typing: true };
        let value = serde_json::to_value(&typing).unwrap();
        assert_eq!(value["type"], "ai_typing");
        assert_eq!(value["isTyping"], true);
    }

    #[test]
    fn test_message_received_from_row() {
        let msg = crate::db::Message::new(
            "m1".to_string(),
            "c1".to_string(),
            crate::db::MessageRole::User,
            "hello".to_string(),
        );
        let value = serde_json::to_value(ServerEvent::message_received(&msg)).unwrap();
        assert_eq!(value["type"], "message_received");
        assert_eq!(value["role"], "user");
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["createdAt"], msg.created_at);
    }
}
