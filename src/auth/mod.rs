//! Session authentication
//!
//! Bearer-token authentication shared by the HTTP layer and the realtime
//! gateway: argon2 password hashing, HS256 session tokens, and resolution
//! of a token to a live user row. A token whose user has been deleted is
//! treated the same as a bad token.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::db::ChatDb;

/// Errors that can occur while resolving or issuing credentials
#[derive(Error, Debug)]
pub enum AuthError {
    /// No token was supplied with the request or handshake
    #[error("no token provided")]
    MissingToken,

    /// Token signature is invalid or the token has expired
    #[error("invalid or expired token")]
    InvalidToken(String),

    /// Token was valid but the referenced user no longer exists
    #[error("user not found")]
    UnknownUser(String),

    /// Password did not meet the minimum requirements
    #[error("password too weak: {0}")]
    WeakPassword(String),

    /// Hashing or persistence failed while authenticating
    #[error("authentication backend error: {0}")]
    Backend(String),
}

/// Claims carried in a session token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

/// A user identity resolved from a valid session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Unique identifier for the user
    pub id: String,
    /// Unique login/display name
    pub username: String,
    /// Unique email address
    pub email: String,
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    if password.len() < 8 {
        return Err(AuthError::WeakPassword(
            "password must be at least 8 characters long".to_string(),
        ));
    }

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Backend(format!("failed to hash password: {}", e)))?
        .to_string();

    Ok(password_hash)
}

/// Verify a password against a stored hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AuthError::Backend(format!("failed to parse hash: {}", e)))?;

    let argon2 = Argon2::default();

    Ok(argon2
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Encode a session token for a user
pub fn encode_token(user_id: &str, secret: &str, ttl_hours: i64) -> Result<String, AuthError> {
    let now = Utc::now();
    let exp = now + Duration::hours(ttl_hours);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Backend(format!("failed to encode token: {}", e)))
}

/// Decode and validate a session token
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    Ok(token_data.claims)
}

/// Resolve a bearer token to a live user identity
///
/// The user row is re-fetched on every call so a deleted account cannot keep
/// using an old token for its remaining lifetime.
pub async fn authenticate(
    db: &ChatDb,
    secret: &str,
    token: &str,
) -> Result<AuthenticatedUser, AuthError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }

    let claims = decode_token(token, secret)?;

    let user = db
        .get_user(&claims.sub)
        .await
        .map_err(|e| AuthError::Backend(e.to_string()))?
        .ok_or_else(|| AuthError::UnknownUser(claims.sub.clone()))?;

    debug!(user_id = %user.id, username = %user.username, "Token resolved to user");

    Ok(AuthenticatedUser {
        id: user.id,
        username: user.username,
        email: user.email,
    })
}

/// Extract a bearer token from an Authorization header value
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
