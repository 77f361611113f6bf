//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults.

use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// OpenAI completion provider configuration
    pub openai: OpenAiConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret used to sign and verify session tokens
    pub jwt_secret: String,
    /// Token lifetime in hours
    pub token_ttl_hours: i64,
}

/// OpenAI completion provider configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for the completion provider (empty disables AI responses)
    pub api_key: String,
    /// Model name to request
    pub model: String,
    /// Base URL of the API (overridable for testing)
    pub base_url: String,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(3000),
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },
            database: DatabaseConfig {
                path: env::var("CHAT_DB_PATH").unwrap_or_else(|_| {
                    if let Some(home) = env::var_os("HOME") {
                        format!("{}/.chat-backend/chat.db", home.to_string_lossy())
                    } else {
                        ".chat-backend/chat.db".to_string()
                    }
                }),
            },
            auth: AuthConfig {
                jwt_secret: env::var("JWT_SECRET")
                    .unwrap_or_else(|_| "fallback-secret".to_string()),
                token_ttl_hours: env::var("JWT_EXPIRES_HOURS")
                    .ok()
                    .and_then(|h| h.parse().ok())
                    .unwrap_or(24),
            },
            openai: OpenAiConfig {
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            },
        }
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addr() {
        let config = Config {
            server: ServerConfig {
                port: 3000,
                host: "127.0.0.1".to_string(),
            },
            database: DatabaseConfig {
                path: "chat.db".to_string(),
            },
            auth: AuthConfig {
                jwt_secret: "secret".to_string(),
                token_ttl_hours: 24,
            },
            openai: OpenAiConfig {
                api_key: String::new(),
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
            },
        };
        assert_eq!(config.server_addr(), "127.0.0.1:3000");
    }
}
