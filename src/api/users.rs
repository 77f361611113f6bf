//! Account API endpoints
//!
//! Signup, login, and current-user lookup. Both signup and login return a
//! session token alongside the account, so the client can open its realtime
//! connection immediately.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::ApiState;
use crate::auth::{self, AuthenticatedUser};
use crate::db::User;
use crate::error::AppError;

/// Request to create an account
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Desired login name
    pub username: String,
    /// Email address
    pub email: String,
    /// Plaintext password; only its hash is stored
    pub password: String,
}

/// Request to log in
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Login name
    pub username: String,
    /// Plaintext password
    pub password: String,
}

/// Account representation returned by the API
#[derive(Debug, Serialize)]
pub struct UserResponse {
    /// User unique identifier
    pub id: String,
    /// Login name
    pub username: String,
    /// Email address
    pub email: String,
    /// Unix timestamp when the account was created
    pub created_at: i64,
}

/// Successful signup or login response
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    /// Session token for subsequent requests and the WebSocket handshake
    pub token: String,
    /// The authenticated account
    pub user: UserResponse,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            created_at: user.created_at,
        }
    }
}

/// POST /api/auth/signup - Create an account
pub async fn signup(
    State(state): State<ApiState>,
    Json(request): Json<SignupRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let username = request.username.trim();
    let email = request.email.trim();
    if username.is_empty() || email.is_empty() {
        return Err(AppError::Validation(
            "username and email are required".to_string(),
        ));
    }

    let password_hash = auth::hash_password(&request.password)?;

    let user = User::new(
        Uuid::new_v4().to_string(),
        username.to_string(),
        email.to_string(),
        password_hash,
    );
    state.db.create_user(&user).await?;

    info!(user_id = %user.id, username = %user.username, "Account created");

    let token = auth::encode_token(&user.id, &state.jwt_secret, state.token_ttl_hours)?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// POST /api/auth/login - Authenticate with username and password
pub async fn login(
    State(state): State<ApiState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    // Unknown user and wrong password are indistinguishable to the caller
    let user = state
        .db
        .get_user_by_username(request.username.trim())
        .await?
        .ok_or(AppError::InvalidCredentials)?;

    if !auth::verify_password(&request.password, &user.password_hash)? {
        return Err(AppError::InvalidCredentials);
    }

    info!(user_id = %user.id, username = %user.username, "User logged in");

    let token = auth::encode_token(&user.id, &state.jwt_secret, state.token_ttl_hours)?;

    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// GET /api/users/:id - Public profile lookup
///
/// No authentication required; never exposes the password hash.
pub async fn get_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, AppError> {
    let user = state
        .db
        .get_user(&id)
        .await?
        .ok_or_else(|| AppError::UserNotFound(id.clone()))?;

    Ok(Json(user.into()))
}

/// GET /api/auth/me - Get the authenticated account
pub async fn current_user(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
) -> Result<Json<UserResponse>, AppError> {
    let row = state
        .db
        .get_user(&user.id)
        .await?
        .ok_or_else(|| AppError::UserNotFound(user.id.clone()))?;

    Ok(Json(row.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::create_test_state;
    use crate::auth::AuthError;

    fn signup_request(username: &str) -> SignupRequest {
        SignupRequest {
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password: "password123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_signup_returns_usable_token() {
        let (state, _temp) = create_test_state().await;

        let response = signup(State(state.clone()), Json(signup_request("alice")))
            .await
            .unwrap()
            .0;
        assert_eq!(response.user.username, "alice");

        let claims = auth::decode_token(&response.token, &state.jwt_secret).unwrap();
        assert_eq!(claims.sub, response.user.id);
    }

    #[tokio::test]
    async fn test_signup_duplicate_username() {
        let (state, _temp) = create_test_state().await;

        signup(State(state.clone()), Json(signup_request("alice")))
            .await
            .unwrap();
        let result = signup(State(state), Json(signup_request("alice"))).await;
        assert!(matches!(result, Err(AppError::DuplicateUser(_))));
    }

    #[tokio::test]
    async fn test_signup_short_password() {
        let (state, _temp) = create_test_state().await;

        let request = SignupRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password: "short".to_string(),
        };
        let result = signup(State(state), Json(request)).await;
        assert!(matches!(
            result,
            Err(AppError::Auth(AuthError::WeakPassword(_)))
        ));
    }

    #[tokio::test]
    async fn test_signup_blank_username() {
        let (state, _temp) = create_test_state().await;

        let request = SignupRequest {
            username: "   ".to_string(),
            email: "alice@example.com".to_string(),
            password: "password123".to_string(),
        };
        let result = signup(State(state), Json(request)).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_login_round_trip() {
        let (state, _temp) = create_test_state().await;

        signup(State(state.clone()), Json(signup_request("alice")))
            .await
            .unwrap();

        let response = login(
            State(state),
            Json(LoginRequest {
                username: "alice".to_string(),
                password: "password123".to_string(),
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(response.user.username, "alice");
        assert!(!response.token.is_empty());
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let (state, _temp) = create_test_state().await;

        signup(State(state.clone()), Json(signup_request("alice")))
            .await
            .unwrap();

        let result = login(
            State(state),
            Json(LoginRequest {
                username: "alice".to_string(),
                password: "not-the-password".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_login_unknown_user() {
        let (state, _temp) = create_test_state().await;

        let result = login(
            State(state),
            Json(LoginRequest {
                username: "nobody".to_string(),
                password: "password123".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_public_profile_lookup() {
        let (state, _temp) = create_test_state().await;

        let created = signup(State(state.clone()), Json(signup_request("alice")))
            .await
            .unwrap()
            .0;

        let profile = get_user(State(state), Path(created.user.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(profile.id, created.user.id);
        assert_eq!(profile.username, "alice");
        assert_eq!(profile.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_public_profile_unknown_user() {
        let (state, _temp) = create_test_state().await;

        let result = get_user(State(state), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(AppError::UserNotFound(_))));
    }

    #[tokio::test]
    async fn test_current_user_roundtrip() {
        let (state, _temp) = create_test_state().await;

        let response = signup(State(state.clone()), Json(signup_request("alice")))
            .await
            .unwrap()
            .0;

        let identity = AuthenticatedUser {
            id: response.user.id.clone(),
            username: response.user.username.clone(),
            email: response.user.email.clone(),
        };
        let me = current_user(State(state), identity).await.unwrap().0;
        assert_eq!(me.id, response.user.id);
        assert_eq!(me.email, "alice@example.com");
    }
}
