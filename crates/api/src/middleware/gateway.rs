//! Gateway token extractor for the management API.
//!
//! End users authenticate at the gateway; this service only checks that a
//! request came through it. When `GATEWAY_TOKEN` is unset every request is
//! accepted.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use cloudbox_core::error::CoreError;

use crate::error::AppError;
use crate::state::AppState;

/// Proof that the request carried `Authorization: Bearer {GATEWAY_TOKEN}`.
///
/// Applied to the `/api/v1` tree with
/// [`axum::middleware::from_extractor_with_state`] rather than per handler.
#[derive(Debug, Clone, Copy)]
pub struct GatewayAuth;

impl FromRequestParts<AppState> for GatewayAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.gateway_token.as_deref() else {
            return Ok(GatewayAuth);
        };

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized("Missing Authorization header".into()))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            return Err(AppError::Core(CoreError::Unauthorized("Invalid gateway token".into())));
        }

        Ok(GatewayAuth)
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_only_identical_input() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
