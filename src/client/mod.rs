//! Headless realtime client
//!
//! Connection adapter for programs that talk to the gateway the way the
//! browser client does: connect with a session token, queue typed events,
//! and receive server events through a channel. Reconnects with capped
//! doubling backoff; an authentication refusal stops immediately because
//! retrying with the same token cannot succeed.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{
    connect_async, tungstenite::Error as WsError, tungstenite::Message, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::ws::events::{ClientEvent, ServerEvent};

/// Reconnection behavior for a client connection
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each failure
    pub initial_delay: Duration,
    /// Upper bound for the retry delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Connection lifecycle and server events, in arrival order
#[derive(Debug)]
pub enum ClientNotification {
    /// The socket is connected; the next event is usually `auth_success`
    Connected,
    /// A decoded server event
    Event(ServerEvent),
    /// The socket dropped; a reconnect attempt follows unless exhausted
    Disconnected,
    /// The server refused the handshake token; no retry will be made
    AuthRequired,
    /// Every reconnect attempt failed
    ConnectionFailed {
        /// Number of consecutive attempts made
        attempts: u32,
    },
}

/// Errors surfaced directly to the caller of client methods
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// Message text was empty or whitespace-only; never sent to the server
    #[error("message cannot be empty")]
    EmptyMessage,

    /// The background connection task has exited
    #[error("client connection is closed")]
    Closed,
}

enum Command {
    Event(ClientEvent),
    Reauthenticate(String),
}

/// Handle for queueing events to the gateway
///
/// Dropping the handle closes the connection.
pub struct ChatSocketClient {
    commands: mpsc::UnboundedSender<Command>,
}

/// Connect to a gateway, spawning the background connection task
///
/// `base_url` is the HTTP base (e.g. `http://localhost:3000`); the token is
/// carried as a query parameter, matching what a browser client does.
pub fn connect(
    base_url: &str,
    token: &str,
    policy: ReconnectPolicy,
) -> (ChatSocketClient, mpsc::UnboundedReceiver<ClientNotification>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(
        base_url.to_string(),
        token.to_string(),
        policy,
        command_rx,
        notify_tx,
    ));

    (
        ChatSocketClient {
            commands: command_tx,
        },
        notify_rx,
    )
}

impl ChatSocketClient {
    /// Join a conversation room
    pub fn join_conversation(&self, conversation_id: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::JoinConversation {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Leave a conversation room
    pub fn leave_conversation(&self, conversation_id: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::LeaveConversation {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Send a chat message, triggering an AI turn server-side
    pub fn send_message(&self, conversation_id: &str, message: &str) -> Result<(), ClientError> {
        if message.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.send(ClientEvent::SendMessage {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
            user_id: None,
        })
    }

    /// Signal that the user started typing
    pub fn typing_start(&self, conversation_id: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::TypingStart {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Signal that the user stopped typing
    pub fn typing_stop(&self, conversation_id: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::TypingStop {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Drop the current connection and reconnect with a fresh session token
    ///
    /// Used when credentials change, e.g. after a re-login.
    pub fn reauthenticate(&self, token: &str) -> Result<(), ClientError> {
        self.commands
            .send(Command::Reauthenticate(token.to_string()))
            .map_err(|_| ClientError::Closed)
    }

    fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.commands
            .send(Command::Event(event))
            .map_err(|_| ClientError::Closed)
    }
}

/// Build the handshake URL from an HTTP base URL and a session token
fn socket_url(base_url: &str, token: &str) -> String {
    let ws_base = base_url
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    format!("{}/ws?token={}", ws_base.trim_end_matches('/'), token)
}

enum Drive {
    HandleDropped,
    ConnectionLost,
    Reauthenticate(String),
}

async fn run(
    base_url: String,
    mut token: String,
    policy: ReconnectPolicy,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notify: mpsc::UnboundedSender<ClientNotification>,
) {
    let mut attempts = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        let url = socket_url(&base_url, &token);
        match connect_async(&url).await {
            Ok((stream, _response)) => {
                info!(url = %url, "WebSocket connection established");
                attempts = 0;
                delay = policy.initial_delay;
                let _ = notify.send(ClientNotification::Connected);

                match drive_connection(stream, &mut commands, &notify).await {
                    Drive::HandleDropped => {
                        debug!("Client handle dropped, closing connection");
                        return;
                    }
                    Drive::ConnectionLost => {
                        let _ = notify.send(ClientNotification::Disconnected);
                    }
                    Drive::Reauthenticate(new_token) => {
                        info!("Reconnecting with a fresh session token");
                        token = new_token;
                        let _ = notify.send(ClientNotification::Disconnected);
                        continue;
                    }
                }
            }
            Err(WsError::Http(response))
                if response.status() == 401 || response.status() == 403 =>
            {
                warn!(
                    url = %url,
                    status = %response.status(),
                    "Handshake rejected, token is invalid or expired"
                );
                let _ = notify.send(ClientNotification::AuthRequired);
                return;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "WebSocket connection failed");
            }
        }

        attempts += 1;
        if attempts >= policy.max_attempts {
            error!(
                url = %url,
                attempts = attempts,
                "Giving up after repeated connection failures"
            );
            let _ = notify.send(ClientNotification::ConnectionFailed { attempts });
            return;
        }

        sleep(delay).await;
        delay = (delay * 2).min(policy.max_delay);
    }
}

/// Pump one live connection until it drops, the handle is dropped, or a
/// token swap is requested
async fn drive_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    notify: &mpsc::UnboundedSender<ClientNotification>,
) -> Drive {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Event(event)) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(error = %e, "Failed to serialize client event");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(payload)).await {
                        warn!(error = %e, "Failed to send event, reconnecting");
                        return Drive::ConnectionLost;
                    }
                }
                Some(Command::Reauthenticate(token)) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Drive::Reauthenticate(token);
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Drive::HandleDropped;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if notify.send(ClientNotification::Event(event)).is_err() {
                                return Drive::HandleDropped;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Received undecodable server event");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        return Drive::ConnectionLost;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Server closed the connection");
                    return Drive::ConnectionLost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket read error");
                    return Drive::ConnectionLost;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_schemes() {
        assert_eq!(
            socket_url("http://localhost:3000", "tok"),
            "ws://localhost:3000/ws?token=tok"
        );
        assert_eq!(
            socket_url("https://chat.example.com/", "tok"),
            "wss://chat.example.com/ws?token=tok"
        );
    }

    #[test]
    fn test_reconnect_policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_message_rejected_locally() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ChatSocketClient { commands: tx };

        assert_eq!(
            client.send_message("c1", "   "),
            Err(ClientError::EmptyMessage)
        );
        assert!(rx.try_recv().is_err(), "nothing should have been queued");

        client.send_message("c1", "hello").unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Event(ClientEvent::SendMessage { .. }))
        ));
    }

    #[test]
    fn test_reauthenticate_queues_token_swap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ChatSocketClient { commands: tx };

        client.reauthenticate("fresh-token").unwrap();
        match rx.try_recv() {
            Ok(Command::Reauthenticate(token)) => assert_eq!(token, "fresh-token"),
            _ => panic!("expected a queued reauthenticate command"),
        }
    }

    #[test]
    fn test_send_after_task_exit_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = ChatSocketClient { commands: tx };
        drop(rx);

        assert_eq!(client.join_conversation("c1"), Err(ClientError::Closed));
    }
}
