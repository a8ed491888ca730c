//! # Management Authentication
//!
//! Bearer-token authentication for the management API. Account handling
//! lives outside this service; the crate carries only the seam: an
//! [`AuthProvider`] that resolves a bearer token to a user id, plus the
//! axum extractor handlers use to require it.
//!
//! [`StaticTokenAuth`] is the bundled provider: a single shared token from
//! configuration, or open single-user access when none is set.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::state::AppState;

pub type UserId = i64;

/// Resolves a bearer token (if any) to an authenticated user.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, bearer: Option<&str>) -> Option<UserId>;
}

/// Single shared-token provider. With no token configured every request
/// authenticates as user 1.
pub struct StaticTokenAuth {
    token: Option<String>,
}

impl StaticTokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn authenticate(&self, bearer: Option<&str>) -> Option<UserId> {
        match &self.token {
            None => Some(1),
            Some(expected) => match bearer {
                Some(presented) if presented == expected => Some(1),
                _ => None,
            },
        }
    }
}

/// Extractor for handlers that require an authenticated caller.
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        state
            .auth
            .authenticate(bearer)
            .await
            .map(AuthUser)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}
