//! Request identity.
//!
//! Identity is verified upstream; requests reach this server with the
//! verified user id in the `X-User-Id` header.

use crate::error::ApiError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use parley_protocol::UserId;

/// Header carrying the verified user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The user on whose behalf a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("Missing X-User-Id header".into()))?;
        let user_id = header
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| ApiError::Unauthorized("Invalid X-User-Id header".into()))?;

        Ok(AuthenticatedUser { user_id })
    }
}
