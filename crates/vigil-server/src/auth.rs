//! Bearer-token session lookup and admin token checks.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use subtle::ConstantTimeEq;

use vigil_shared::types::UserId;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::error::ServerError;

/// The user owning the request's session token. Rejects with 401 when the
/// header is missing or the token is unknown.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ServerError::Unauthorized)?;
        resolve_session(state, token).await.map(AuthUser)
    }
}

pub async fn resolve_session(state: &AppState, token: &str) -> Result<UserId, ServerError> {
    if token.is_empty() {
        return Err(ServerError::Unauthorized);
    }
    state
        .db
        .lock()
        .await
        .session_user(token)?
        .ok_or(ServerError::Unauthorized)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

pub fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = bearer_token(headers).unwrap_or("");

    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_admin_token() {
        let config = ServerConfig {
            admin_token: Some("root-token".into()),
            ..ServerConfig::default()
        };
        assert!(verify_admin_token(&headers("Bearer root-token"), &config).is_ok());
        assert!(verify_admin_token(&headers("Bearer root-tokem"), &config).is_err());
        assert!(verify_admin_token(&HeaderMap::new(), &config).is_err());

        let disabled = ServerConfig::default();
        assert!(matches!(
            verify_admin_token(&headers("Bearer root-token"), &disabled),
            Err(ServerError::Forbidden(_))
        ));
    }
}
