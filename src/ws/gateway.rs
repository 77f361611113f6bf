//! Realtime chat gateway
//!
//! Owns every live WebSocket connection: the session table mapping a
//! connection id to its authenticated identity, the per-conversation room
//! membership used for fan-out, and the per-conversation serialization of
//! AI turns. All operation failures are converted to scoped events at the
//! handler boundary; only handshake failures terminate a connection.

use crate::auth::AuthenticatedUser;
use crate::completion::{ChatMessage, CompletionProvider};
use crate::db::{ChatDb, Message, MessageRole};
use crate::error::AppError;
use crate::ws::events::{ClientEvent, ErrorCode, ServerEvent};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Opaque identifier for a live connection
pub type ConnectionId = String;

/// Immutable association between a connection and its authenticated user,
/// plus the rooms the connection has joined. Identity is fixed at handshake
/// time; only `joined_rooms` is mutated, and only by events from this same
/// connection or by disconnect cleanup.
struct ConnectionContext {
    user: AuthenticatedUser,
    sender: mpsc::UnboundedSender<WsMessage>,
    joined_rooms: HashSet<String>,
}

/// The realtime gateway
pub struct ChatGateway {
    db: Arc<ChatDb>,
    provider: Arc<dyn CompletionProvider>,
    connections: RwLock<HashMap<ConnectionId, ConnectionContext>>,
    rooms: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    // Entries are never removed; one small lock per conversation ever chatted in.
    turn_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

static GLOBAL: OnceCell<Arc<ChatGateway>> = OnceCell::new();

/// Install the process-wide gateway instance
///
/// Callable exactly once per process, at startup; a second call is an error.
pub fn install(gateway: Arc<ChatGateway>) -> Result<(), AppError> {
    GLOBAL
        .set(gateway)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("chat gateway is already installed")))
}

/// Get the process-wide gateway instance
///
/// # Panics
/// Panics if `install` has not been called yet.
pub fn global() -> Arc<ChatGateway> {
    try_global().expect("chat gateway requested before install(); call ws::gateway::install at startup")
}

/// Get the process-wide gateway instance if one has been installed
pub fn try_global() -> Option<Arc<ChatGateway>> {
    GLOBAL.get().cloned()
}

impl ChatGateway {
    /// Create a new gateway over the given persistence and completion services
    pub fn new(db: Arc<ChatDb>, provider: Arc<dyn CompletionProvider>) -> Arc<Self> {
        Arc::new(Self {
            db,
            provider,
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            turn_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of connections currently in a conversation's room
    pub async fn room_size(&self, conversation_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(conversation_id)
            .map_or(0, |members| members.len())
    }

    /// Drive an authenticated WebSocket connection until it closes
    ///
    /// The caller has already completed the handshake; this registers the
    /// connection, confirms authentication to the client, and processes
    /// events until disconnect.
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket, user: AuthenticatedUser) {
        let connection_id: ConnectionId = Uuid::new_v4().to_string();
        let (mut sender, mut receiver) = socket.split();

        info!(
            connection_id = %connection_id,
            user = %user.username,
            "WebSocket client connected"
        );

        // Use a channel to send messages from handlers to the socket
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        self.register_connection(&connection_id, user.clone(), tx.clone())
            .await;

        // Confirm authentication to this connection alone
        self.emit_to(
            &connection_id,
            &ServerEvent::AuthSuccess {
                user_id: user.id.clone(),
                username: user.username.clone(),
                email: user.email.clone(),
            },
        )
        .await;

        // Task to forward messages from channel to sender
        let mut send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sender.send(msg).await {
                    error!("Failed to send message: {}", e);
                    break;
                }
            }
        });

        // Task to send periodic pings
        let ping_tx = tx.clone();
        let mut ping_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
                if ping_tx.send(WsMessage::Ping(vec![])).is_err() {
                    break;
                }
            }
        });

        // Receive messages
        let gateway = self.clone();
        let recv_connection_id = connection_id.clone();
        let mut recv_task = tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        gateway.handle_text(&recv_connection_id, &text).await;
                    }
                    Ok(WsMessage::Close(_)) => {
                        info!(
                            connection_id = %recv_connection_id,
                            "WebSocket client disconnected"
                        );
                        break;
                    }
                    Ok(WsMessage::Pong(_)) => {
                        // Client responded to ping
                    }
                    Err(e) => {
                        error!(
                            connection_id = %recv_connection_id,
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Wait for any task to complete
        tokio::select! {
            _ = &mut send_task => {
                ping_task.abort();
                recv_task.abort();
            }
            _ = &mut ping_task => {
                send_task.abort();
                recv_task.abort();
            }
            _ = &mut recv_task => {
                send_task.abort();
                ping_task.abort();
            }
        }

        self.disconnect(&connection_id).await;

        info!(connection_id = %connection_id, "WebSocket connection closed");
    }

    /// Register a connection in the session table
    async fn register_connection(
        &self,
        connection_id: &ConnectionId,
        user: AuthenticatedUser,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) {
        let mut connections = self.connections.write().await;
        connections.insert(
            connection_id.clone(),
            ConnectionContext {
                user,
                sender,
                joined_rooms: HashSet::new(),
            },
        );
    }

    /// Parse a text frame and dispatch it, converting every failure into a
    /// scoped event on this connection
    async fn handle_text(&self, connection_id: &ConnectionId, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "Received malformed event payload"
                );
                self.emit_to(
                    connection_id,
                    &ServerEvent::error(
                        ErrorCode::MissingRequiredFields,
                        "Invalid or incomplete event payload",
                    ),
                )
                .await;
                return;
            }
        };

        if let Err(e) = self.handle_event(connection_id, event).await {
            error!(
                connection_id = %connection_id,
                error = %e,
                "Failed to process event"
            );
            self.emit_to(
                connection_id,
                &ServerEvent::error(ErrorCode::MessageProcessingError, "Failed to process message"),
            )
            .await;
        }
    }

    /// Dispatch a decoded client event
    async fn handle_event(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<(), AppError> {
        match event {
            ClientEvent::JoinConversation { conversation_id } => {
                self.handle_join(connection_id, &conversation_id).await
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                self.handle_leave(connection_id, &conversation_id).await
            }
            ClientEvent::SendMessage {
                conversation_id,
                message,
                user_id,
            } => {
                self.handle_send_message(
                    connection_id,
                    &conversation_id,
                    &message,
                    user_id.as_deref(),
                )
                .await
            }
            ClientEvent::TypingStart { conversation_id } => {
                self.handle_typing(connection_id, &conversation_id, true).await
            }
            ClientEvent::TypingStop { conversation_id } => {
                self.handle_typing(connection_id, &conversation_id, false).await
            }
        }
    }

    /// Look up the authenticated identity for a connection
    async fn connection_user(&self, connection_id: &ConnectionId) -> Option<AuthenticatedUser> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|ctx| ctx.user.clone())
    }

    /// Join a conversation room, verifying ownership first
    ///
    /// Idempotent: joining an already-joined room is a no-op success.
    async fn handle_join(
        &self,
        connection_id: &ConnectionId,
        conversation_id: &str,
    ) -> Result<(), AppError> {
        let Some(user) = self.connection_user(connection_id).await else {
            return Ok(());
        };

        if self
            .db
            .get_user_conversation(conversation_id, &user.id)
            .await?
            .is_none()
        {
            warn!(
                user = %user.username,
                conversation_id = %conversation_id,
                "Join denied: conversation not found or not owned by user"
            );
            self.emit_to(
                connection_id,
                &ServerEvent::error(
                    ErrorCode::ConversationAccessDenied,
                    "Conversation not found or access denied",
                ),
            )
            .await;
            return Ok(());
        }

        {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(conversation_id.to_string())
                .or_default()
                .insert(connection_id.clone());
        }
        {
            let mut connections = self.connections.write().await;
            if let Some(ctx) = connections.get_mut(connection_id) {
                ctx.joined_rooms.insert(conversation_id.to_string());
            }
        }

        info!(
            connection_id = %connection_id,
            user = %user.username,
            conversation_id = %conversation_id,
            "Joined conversation room"
        );

        self.emit_to(
            connection_id,
            &ServerEvent::ConversationJoined {
                conversation_id: conversation_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Leave a conversation room; no-op on membership if not a member
    async fn handle_leave(
        &self,
        connection_id: &ConnectionId,
        conversation_id: &str,
    ) -> Result<(), AppError> {
        {
            let mut rooms = self.rooms.write().await;
            if let Some(members) = rooms.get_mut(conversation_id) {
                members.remove(connection_id);
                if members.is_empty() {
                    rooms.remove(conversation_id);
                }
            }
        }
        {
            let mut connections = self.connections.write().await;
            if let Some(ctx) = connections.get_mut(connection_id) {
                ctx.joined_rooms.remove(conversation_id);
            }
        }

        debug!(
            connection_id = %connection_id,
            conversation_id = %conversation_id,
            "Left conversation room"
        );

        self.emit_to(
            connection_id,
            &ServerEvent::ConversationLeft {
                conversation_id: conversation_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Persist a user message, fan it out, and run the AI turn
    async fn handle_send_message(
        &self,
        connection_id: &ConnectionId,
        conversation_id: &str,
        text: &str,
        claimed_user_id: Option<&str>,
    ) -> Result<(), AppError> {
        let Some(user) = self.connection_user(connection_id).await else {
            return Ok(());
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            self.emit_to(
                connection_id,
                &ServerEvent::error(ErrorCode::EmptyMessage, "Message cannot be empty"),
            )
            .await;
            return Ok(());
        }

        if let Some(claimed) = claimed_user_id {
            if claimed != user.id {
                warn!(
                    user = %user.username,
                    claimed_user_id = %claimed,
                    "Security violation: message sent with mismatched user id"
                );
                self.emit_to(
                    connection_id,
                    &ServerEvent::error(ErrorCode::UserIdMismatch, "Unauthorized: user ID mismatch"),
                )
                .await;
                return Ok(());
            }
        }

        // Ownership is re-verified on every send; room membership is never
        // trusted for authorization.
        if self
            .db
            .get_user_conversation(conversation_id, &user.id)
            .await?
            .is_none()
        {
            warn!(
                user = %user.username,
                conversation_id = %conversation_id,
                "Send denied: conversation not found or not owned by user"
            );
            self.emit_to(
                connection_id,
                &ServerEvent::error(
                    ErrorCode::ConversationAccessDenied,
                    "Conversation not found or access denied",
                ),
            )
            .await;
            return Ok(());
        }

        // At most one in-flight AI turn per conversation: a second send
        // waits here until the previous turn has fully completed.
        let turn_lock = self.turn_lock(conversation_id);
        let _turn = turn_lock.lock().await;

        let user_message = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id.to_string(),
            MessageRole::User,
            trimmed.to_string(),
        );
        self.db.add_message(&user_message).await?;

        info!(
            message_id = %user_message.id,
            user = %user.username,
            conversation_id = %conversation_id,
            "User message saved"
        );

        // Sender included, so its temporary client-side echo can be replaced
        self.broadcast(conversation_id, &ServerEvent::message_received(&user_message))
            .await;

        self.run_ai_turn(conversation_id).await;
        Ok(())
    }

    /// Re-broadcast a typing indicator to every other room member
    async fn handle_typing(
        &self,
        connection_id: &ConnectionId,
        conversation_id: &str,
        is_typing: bool,
    ) -> Result<(), AppError> {
        let Some(user) = self.connection_user(connection_id).await else {
            return Ok(());
        };

        if self
            .db
            .get_user_conversation(conversation_id, &user.id)
            .await?
            .is_none()
        {
            warn!(
                user = %user.username,
                conversation_id = %conversation_id,
                "Typing denied: conversation not found or not owned by user"
            );
            self.emit_to(
                connection_id,
                &ServerEvent::error(
                    ErrorCode::ConversationAccessDenied,
                    "Conversation not found or access denied",
                ),
            )
            .await;
            return Ok(());
        }

        self.broadcast_except(
            conversation_id,
            connection_id,
            &ServerEvent::UserTyping {
                user_id: user.id,
                username: user.username,
                is_typing,
            },
        )
        .await;
        Ok(())
    }

    /// Run one AI turn for a conversation
    ///
    /// The typing indicator is always reset, no matter where the turn fails.
    async fn run_ai_turn(&self, conversation_id: &str) {
        self.broadcast(conversation_id, &ServerEvent::AiTyping { is_typing: true })
            .await;

        if let Err(e) = self.stream_ai_response(conversation_id).await {
            error!(
                conversation_id = %conversation_id,
                error = %e,
                "AI turn failed"
            );
            self.broadcast(
                conversation_id,
                &ServerEvent::AiResponseError {
                    message: "Failed to generate AI response".to_string(),
                    error: e.to_string(),
                },
            )
            .await;
        }

        self.broadcast(conversation_id, &ServerEvent::AiTyping { is_typing: false })
            .await;
    }

    /// Stream the assistant response for a conversation and persist it
    ///
    /// Chunks are re-broadcast in the exact order the provider yields them;
    /// `ai_response_complete` is emitted strictly after the last chunk.
    async fn stream_ai_response(&self, conversation_id: &str) -> Result<(), AppError> {
        let history = self.db.get_messages(conversation_id).await?;
        let chat_messages: Vec<ChatMessage> = history
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();

        let mut rx = self.provider.stream_completion(chat_messages).await?;

        let mut full_response = String::new();
        while let Some(fragment) = rx.recv().await {
            let content = fragment?;
            if content.is_empty() {
                continue;
            }
            full_response.push_str(&content);
            self.broadcast(
                conversation_id,
                &ServerEvent::AiResponseChunk {
                    content,
                    is_complete: false,
                    message_id: None,
                },
            )
            .await;
        }

        let assistant_message = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id.to_string(),
            MessageRole::Assistant,
            full_response,
        );
        self.db.add_message(&assistant_message).await?;

        info!(
            message_id = %assistant_message.id,
            conversation_id = %conversation_id,
            response_len = assistant_message.content.len(),
            "Assistant message saved"
        );

        self.broadcast(
            conversation_id,
            &ServerEvent::ai_response_complete(&assistant_message),
        )
        .await;
        Ok(())
    }

    /// Remove a connection from the session table and every room
    async fn disconnect(&self, connection_id: &ConnectionId) {
        let joined = {
            let mut connections = self.connections.write().await;
            connections
                .remove(connection_id)
                .map(|ctx| ctx.joined_rooms)
        };

        if let Some(joined) = joined {
            let mut rooms = self.rooms.write().await;
            for room in joined {
                if let Some(members) = rooms.get_mut(&room) {
                    members.remove(connection_id);
                    if members.is_empty() {
                        rooms.remove(&room);
                    }
                }
            }
        }

        debug!(connection_id = %connection_id, "Connection removed from all rooms");
    }

    /// Get (or create) the turn-serialization lock for a conversation
    fn turn_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().expect("turn lock table poisoned");
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Send an event to a single connection
    async fn emit_to(&self, connection_id: &ConnectionId, event: &ServerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                return;
            }
        };

        let connections = self.connections.read().await;
        if let Some(ctx) = connections.get(connection_id) {
            if ctx.sender.send(WsMessage::Text(payload)).is_err() {
                debug!(
                    connection_id = %connection_id,
                    "Dropping event to closed connection"
                );
            }
        }
    }

    /// Broadcast an event to every member of a conversation room
    async fn broadcast(&self, conversation_id: &str, event: &ServerEvent) {
        self.broadcast_filtered(conversation_id, None, event).await;
    }

    /// Broadcast an event to every room member except one connection
    async fn broadcast_except(
        &self,
        conversation_id: &str,
        except: &ConnectionId,
        event: &ServerEvent,
    ) {
        self.broadcast_filtered(conversation_id, Some(except), event)
            .await;
    }

    async fn broadcast_filtered(
        &self,
        conversation_id: &str,
        except: Option<&ConnectionId>,
        event: &ServerEvent,
    ) {
        let members: Vec<ConnectionId> = {
            let rooms = self.rooms.read().await;
            match rooms.get(conversation_id) {
                Some(members) => members
                    .iter()
                    .filter(|id| except.map_or(true, |ex| ex != *id))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                return;
            }
        };

        let connections = self.connections.read().await;
        for member in members {
            if let Some(ctx) = connections.get(&member) {
                if ctx.sender.send(WsMessage::Text(payload.clone())).is_err() {
                    debug!(
                        connection_id = %member,
                        "Dropping broadcast to closed connection"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionError;
    use crate::db::{Conversation, User};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Provider that replays a fixed script, optionally slowly or failing
    struct ScriptedProvider {
        fragments: Vec<String>,
        fragment_delay: std::time::Duration,
        fail_upfront: bool,
        fail_mid_stream: bool,
    }

    impl ScriptedProvider {
        fn fragments(fragments: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                fragment_delay: std::time::Duration::ZERO,
                fail_upfront: false,
                fail_mid_stream: false,
            })
        }

        fn slow(fragments: &[&str], fragment_delay: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                fragment_delay,
                fail_upfront: false,
                fail_mid_stream: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fragments: Vec::new(),
                fragment_delay: std::time::Duration::ZERO,
                fail_upfront: true,
                fail_mid_stream: false,
            })
        }

        fn failing_mid_stream(fragments: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                fragment_delay: std::time::Duration::ZERO,
                fail_upfront: false,
                fail_mid_stream: true,
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn stream_completion(
            &self,
            _history: Vec<ChatMessage>,
        ) -> Result<mpsc::Receiver<Result<String, CompletionError>>, CompletionError> {
            if self.fail_upfront {
                return Err(CompletionError::Api {
                    status: 500,
                    body: "provider exploded".to_string(),
                });
            }

            let (tx, rx) = mpsc::channel(8);
            let fragments = self.fragments.clone();
            let fragment_delay = self.fragment_delay;
            let fail_mid_stream = self.fail_mid_stream;
            tokio::spawn(async move {
                for fragment in fragments {
                    if !fragment_delay.is_zero() {
                        tokio::time::sleep(fragment_delay).await;
                    }
                    if tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
                if fail_mid_stream {
                    let _ = tx
                        .send(Err(CompletionError::Stream("connection reset".to_string())))
                        .await;
                }
            });
            Ok(rx)
        }
    }

    struct Fixture {
        gateway: Arc<ChatGateway>,
        db: Arc<ChatDb>,
        _temp: TempDir,
    }

    async fn fixture(provider: Arc<dyn CompletionProvider>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db");
        let db = Arc::new(
            ChatDb::new(db_path.to_str().unwrap())
                .await
                .expect("Failed to create test database"),
        );
        Fixture {
            gateway: ChatGateway::new(db.clone(), provider),
            db,
            _temp: temp,
        }
    }

    async fn seed_user(db: &ChatDb, username: &str) -> User {
        let user = User::new(
            Uuid::new_v4().to_string(),
            username.to_string(),
            format!("{}@example.com", username),
            "hash".to_string(),
        );
        db.create_user(&user).await.unwrap();
        user
    }

    async fn seed_conversation(db: &ChatDb, user: &User) -> Conversation {
        let conv = Conversation::new(
            Uuid::new_v4().to_string(),
            user.id.clone(),
            "Test chat".to_string(),
        );
        db.create_conversation(&conv).await.unwrap();
        conv
    }

    async fn open_connection(
        gateway: &ChatGateway,
        user: &User,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<WsMessage>) {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        gateway
            .register_connection(
                &connection_id,
                AuthenticatedUser {
                    id: user.id.clone(),
                    username: user.username.clone(),
                    email: user.email.clone(),
                },
                tx,
            )
            .await;
        (connection_id, rx)
    }

    /// Pop the next already-queued event, skipping non-text frames
    fn next_event(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> ServerEvent {
        loop {
            match rx.try_recv() {
                Ok(WsMessage::Text(text)) => {
                    return serde_json::from_str(&text).expect("undecodable server event")
                }
                Ok(_) => continue,
                Err(_) => panic!("expected a queued server event"),
            }
        }
    }

    fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<WsMessage>) {
        assert!(rx.try_recv().is_err(), "expected no queued server event");
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn, &conv.id).await.unwrap();
        f.gateway.handle_join(&conn, &conv.id).await.unwrap();

        assert_eq!(f.gateway.room_size(&conv.id).await, 1);
        for _ in 0..2 {
            match next_event(&mut rx) {
                ServerEvent::ConversationJoined { conversation_id } => {
                    assert_eq!(conversation_id, conv.id)
                }
                other => panic!("expected conversation_joined, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_join_denied_for_non_owner() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let alice = seed_user(&f.db, "alice").await;
        let bob = seed_user(&f.db, "bob").await;
        let conv = seed_conversation(&f.db, &alice).await;
        let (conn, mut rx) = open_connection(&f.gateway, &bob).await;

        f.gateway.handle_join(&conn, &conv.id).await.unwrap();

        assert_eq!(f.gateway.room_size(&conv.id).await, 0);
        match next_event(&mut rx) {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::ConversationAccessDenied)
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leave_removes_membership() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn, &conv.id).await.unwrap();
        f.gateway.handle_leave(&conn, &conv.id).await.unwrap();

        assert_eq!(f.gateway.room_size(&conv.id).await, 0);
        let _joined = next_event(&mut rx);
        match next_event(&mut rx) {
            ServerEvent::ConversationLeft { conversation_id } => {
                assert_eq!(conversation_id, conv.id)
            }
            other => panic!("expected conversation_left, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_message_never_persists() {
        let f = fixture(ScriptedProvider::fragments(&["never"])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway
            .handle_send_message(&conn, &conv.id, "   ", None)
            .await
            .unwrap();

        match next_event(&mut rx) {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::EmptyMessage),
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(f.db.get_messages(&conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_id_mismatch_rejected() {
        let f = fixture(ScriptedProvider::fragments(&["never"])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway
            .handle_send_message(&conn, &conv.id, "hello", Some("someone-else"))
            .await
            .unwrap();

        match next_event(&mut rx) {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::UserIdMismatch),
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(f.db.get_messages(&conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_denied_for_non_owner() {
        let f = fixture(ScriptedProvider::fragments(&["never"])).await;
        let alice = seed_user(&f.db, "alice").await;
        let bob = seed_user(&f.db, "bob").await;
        let conv = seed_conversation(&f.db, &alice).await;
        let (conn, mut rx) = open_connection(&f.gateway, &bob).await;

        f.gateway
            .handle_send_message(&conn, &conv.id, "hello", None)
            .await
            .unwrap();

        match next_event(&mut rx) {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::ConversationAccessDenied)
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(f.db.get_messages(&conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_streams_and_persists() {
        let f = fixture(ScriptedProvider::fragments(&["Hello", " world"])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn_a, mut rx_a) = open_connection(&f.gateway, &user).await;
        let (conn_b, mut rx_b) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn_a, &conv.id).await.unwrap();
        f.gateway.handle_join(&conn_b, &conv.id).await.unwrap();
        let _ = next_event(&mut rx_a);
        let _ = next_event(&mut rx_b);

        f.gateway
            .handle_send_message(&conn_a, &conv.id, "hi there", None)
            .await
            .unwrap();

        // Both room members, sender included, see the identical sequence
        for rx in [&mut rx_a, &mut rx_b] {
            match next_event(rx) {
                ServerEvent::MessageReceived { content, role, .. } => {
                    assert_eq!(content, "hi there");
                    assert_eq!(role, "user");
                }
                other => panic!("expected message_received, got {:?}", other),
            }
            match next_event(rx) {
                ServerEvent::AiTyping { is_typing } => assert!(is_typing),
                other => panic!("expected ai_typing, got {:?}", other),
            }
            let mut streamed = String::new();
            loop {
                match next_event(rx) {
                    ServerEvent::AiResponseChunk {
                        content,
                        is_complete,
                        message_id,
                    } => {
                        assert!(!is_complete);
                        assert!(message_id.is_none());
                        streamed.push_str(&content);
                    }
                    ServerEvent::AiResponseComplete { content, role, .. } => {
                        assert_eq!(content, "Hello world");
                        assert_eq!(role, "assistant");
                        break;
                    }
                    other => panic!("expected chunk or complete, got {:?}", other),
                }
            }
            assert_eq!(streamed, "Hello world");
            match next_event(rx) {
                ServerEvent::AiTyping { is_typing } => assert!(!is_typing),
                other => panic!("expected ai_typing false, got {:?}", other),
            }
        }

        let messages = f.db.get_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hi there");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "Hello world");
    }

    #[tokio::test]
    async fn test_overlapping_sends_do_not_interleave_turns() {
        let f = fixture(ScriptedProvider::slow(
            &["one ", "two ", "three"],
            std::time::Duration::from_millis(40),
        ))
        .await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn_a, mut rx_a) = open_connection(&f.gateway, &user).await;
        let (conn_b, _rx_b) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn_a, &conv.id).await.unwrap();
        f.gateway.handle_join(&conn_b, &conv.id).await.unwrap();
        let _ = next_event(&mut rx_a);

        // Fire the second send while the first turn is still streaming
        let first = {
            let gateway = f.gateway.clone();
            let conn = conn_a.clone();
            let conv_id = conv.id.clone();
            tokio::spawn(async move {
                gateway
                    .handle_send_message(&conn, &conv_id, "first", None)
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let second = {
            let gateway = f.gateway.clone();
            let conn = conn_b.clone();
            let conv_id = conv.id.clone();
            tokio::spawn(async move {
                gateway
                    .handle_send_message(&conn, &conv_id, "second", None)
                    .await
                    .unwrap();
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        let mut events = Vec::new();
        while let Ok(WsMessage::Text(text)) = rx_a.try_recv() {
            events.push(serde_json::from_str::<ServerEvent>(&text).unwrap());
        }

        // Two complete turns back to back, never interleaved
        let mut iter = events.into_iter();
        for expected in ["first", "second"] {
            match iter.next() {
                Some(ServerEvent::MessageReceived { content, .. }) => {
                    assert_eq!(content, expected)
                }
                other => panic!("expected message_received({}), got {:?}", expected, other),
            }
            match iter.next() {
                Some(ServerEvent::AiTyping { is_typing }) => assert!(is_typing),
                other => panic!("expected ai_typing true, got {:?}", other),
            }
            let mut streamed = String::new();
            loop {
                match iter.next() {
                    Some(ServerEvent::AiResponseChunk { content, .. }) => {
                        streamed.push_str(&content)
                    }
                    Some(ServerEvent::AiResponseComplete { content, .. }) => {
                        assert_eq!(content, "one two three");
                        break;
                    }
                    other => panic!("expected chunk or complete, got {:?}", other),
                }
            }
            assert_eq!(streamed, "one two three");
            match iter.next() {
                Some(ServerEvent::AiTyping { is_typing }) => assert!(!is_typing),
                other => panic!("expected ai_typing false, got {:?}", other),
            }
        }
        assert!(iter.next().is_none(), "no events past the second turn");

        let messages = f.db.get_messages(&conv.id).await.unwrap();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "user", "assistant"]);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[2].content, "second");
    }

    #[tokio::test]
    async fn test_provider_failure_resets_typing() {
        let f = fixture(ScriptedProvider::failing()).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn, &conv.id).await.unwrap();
        let _ = next_event(&mut rx);

        f.gateway
            .handle_send_message(&conn, &conv.id, "hello", None)
            .await
            .unwrap();

        let _ = next_event(&mut rx); // message_received
        match next_event(&mut rx) {
            ServerEvent::AiTyping { is_typing } => assert!(is_typing),
            other => panic!("expected ai_typing, got {:?}", other),
        }
        match next_event(&mut rx) {
            ServerEvent::AiResponseError { .. } => {}
            other => panic!("expected ai_response_error, got {:?}", other),
        }
        match next_event(&mut rx) {
            ServerEvent::AiTyping { is_typing } => assert!(!is_typing),
            other => panic!("expected ai_typing false, got {:?}", other),
        }

        // Only the user message was persisted
        let messages = f.db.get_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_persists_nothing_from_turn() {
        let f = fixture(ScriptedProvider::failing_mid_stream(&["partial"])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn, &conv.id).await.unwrap();
        let _ = next_event(&mut rx);

        f.gateway
            .handle_send_message(&conn, &conv.id, "hello", None)
            .await
            .unwrap();

        let mut saw_error = false;
        let mut last_typing = None;
        loop {
            match rx.try_recv() {
                Ok(WsMessage::Text(text)) => {
                    match serde_json::from_str::<ServerEvent>(&text).unwrap() {
                        ServerEvent::AiResponseError { .. } => saw_error = true,
                        ServerEvent::AiTyping { is_typing } => last_typing = Some(is_typing),
                        _ => {}
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_error);
        assert_eq!(last_typing, Some(false));

        let messages = f.db.get_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 1, "assistant message must not be persisted");
    }

    #[tokio::test]
    async fn test_typing_excludes_sender() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv = seed_conversation(&f.db, &user).await;
        let (conn_a, mut rx_a) = open_connection(&f.gateway, &user).await;
        let (conn_b, mut rx_b) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn_a, &conv.id).await.unwrap();
        f.gateway.handle_join(&conn_b, &conv.id).await.unwrap();
        let _ = next_event(&mut rx_a);
        let _ = next_event(&mut rx_b);

        f.gateway.handle_typing(&conn_a, &conv.id, true).await.unwrap();

        match next_event(&mut rx_b) {
            ServerEvent::UserTyping {
                user_id, is_typing, ..
            } => {
                assert_eq!(user_id, user.id);
                assert!(is_typing);
            }
            other => panic!("expected user_typing, got {:?}", other),
        }
        assert_no_event(&mut rx_a);
    }

    #[tokio::test]
    async fn test_typing_denied_for_non_owner() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let alice = seed_user(&f.db, "alice").await;
        let bob = seed_user(&f.db, "bob").await;
        let conv = seed_conversation(&f.db, &alice).await;
        let (conn, mut rx) = open_connection(&f.gateway, &bob).await;

        f.gateway.handle_typing(&conn, &conv.id, true).await.unwrap();

        match next_event(&mut rx) {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::ConversationAccessDenied)
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_cleans_all_rooms() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let user = seed_user(&f.db, "alice").await;
        let conv_a = seed_conversation(&f.db, &user).await;
        let conv_b = seed_conversation(&f.db, &user).await;
        let (conn, _rx) = open_connection(&f.gateway, &user).await;

        f.gateway.handle_join(&conn, &conv_a.id).await.unwrap();
        f.gateway.handle_join(&conn, &conv_b.id).await.unwrap();
        assert_eq!(f.gateway.connection_count().await, 1);

        f.gateway.disconnect(&conn).await;

        assert_eq!(f.gateway.connection_count().await, 0);
        assert_eq!(f.gateway.room_size(&conv_a.id).await, 0);
        assert_eq!(f.gateway.room_size(&conv_b.id).await, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_reports_missing_fields() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;
        let user = seed_user(&f.db, "alice").await;
        let (conn, mut rx) = open_connection(&f.gateway, &user).await;

        f.gateway
            .handle_text(&conn, r#"{"type":"send_message","message":"no id"}"#)
            .await;

        match next_event(&mut rx) {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::MissingRequiredFields)
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_install_lifecycle() {
        let f = fixture(ScriptedProvider::fragments(&[])).await;

        assert!(try_global().is_none());
        install(f.gateway.clone()).unwrap();
        assert!(try_global().is_some());
        assert_eq!(global().connection_count().await, 0);
        assert!(install(f.gateway.clone()).is_err());
    }
}
