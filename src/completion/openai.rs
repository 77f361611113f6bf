//! OpenAI chat-completion client
//!
//! Direct HTTP client for the streaming chat completions endpoint. Fragments
//! are decoded incrementally from the SSE response body and forwarded through
//! a channel as they arrive.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChatMessage, CompletionError, CompletionProvider, SYSTEM_PROMPT};

const STREAM_CHANNEL_CAPACITY: usize = 64;
const SSE_DONE_SIGNAL: &str = "[DONE]";

/// Streaming OpenAI chat-completion provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

/// Request payload for the chat completions endpoint
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

/// One SSE chunk of a streaming chat completion
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    /// Create a provider from configuration values
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn stream_completion(
        &self,
        history: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, CompletionError>>, CompletionError> {
        if self.api_key.is_empty() {
            return Err(CompletionError::MissingApiKey);
        }

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        messages.extend(history);

        let request_body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            temperature: 0.7,
            max_tokens: 150,
        };

        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            url = %url,
            model = %request_body.model,
            history_len = request_body.messages.len(),
            "Requesting streaming chat completion"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut body_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();

            while let Some(chunk) = body_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(CompletionError::Stream(e.to_string()))).await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE events are newline-delimited; a chunk may hold a
                // partial line, so keep the tail in the buffer.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();

                    if payload == SSE_DONE_SIGNAL {
                        return;
                    }

                    match serde_json::from_str::<StreamChunk>(payload) {
                        Ok(parsed) => {
                            let content = parsed
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.as_deref())
                                .unwrap_or_default();
                            if !content.is_empty()
                                && tx.send(Ok(content.to_string())).await.is_err()
                            {
                                // Receiver dropped, stop reading
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                payload_len = payload.len(),
                                "Failed to parse completion stream chunk"
                            );
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
