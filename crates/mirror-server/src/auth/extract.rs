//! Axum extractor that gates a handler on a valid token.
//!
//! The token is taken from:
//! 1. `Authorization: Bearer <token>` (or the bare token)
//! 2. `?token=<token>` (browsers cannot set headers on WebSocket upgrades)

use super::TokenVerifier;
use crate::server::ApiError;
use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::request::Parts;
use mirror_core::MirrorError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Proof that the request carried a valid token. Holds the request source.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub source: String,
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for Authorized
where
    Arc<TokenVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<TokenVerifier>::from_ref(state);
        let source = source_of(parts);
        let token = extract_token(parts).ok_or(MirrorError::Unauthorized)?;
        if verifier.verify(&token, &source) {
            Ok(Authorized { source })
        } else {
            Err(MirrorError::PermissionDenied("invalid token".into()).into())
        }
    }
}

/// Peer address if the server was started with connect info.
pub fn source_of(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let value = value.trim();
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    let query = parts.uri.query()?;
    serde_urlencoded::from_str::<TokenQuery>(query)
        .ok()?
        .token
        .filter(|t| !t.is_empty())
}
