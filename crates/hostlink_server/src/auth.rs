//! Shared-secret authentication for the HTTP file API.

use crate::error::ApiError;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

/// Header carrying the shared secret.
pub const TOKEN_HEADER: &str = "x-auth-token";

/// The expected token, installed as a request extension.
#[derive(Clone)]
pub struct TokenAuth {
    token: Arc<str>,
}

impl TokenAuth {
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::from(token),
        }
    }

    pub fn verify(&self, presented: &str) -> bool {
        presented.as_bytes().ct_eq(self.token.as_bytes()).into()
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Extractor that rejects the request unless it carries the shared token.
///
/// The token is read from the `x-auth-token` header, or from a `token` query
/// parameter so plain download links work.
pub struct RequireToken;

impl<S> FromRequestParts<S> for RequireToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(auth) = parts.extensions.get::<TokenAuth>() else {
            error!("TokenAuth extension missing from router");
            return Err(ApiError::Internal);
        };

        let from_header = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let presented = match from_header {
            Some(token) => Some(token),
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.token),
        };

        match presented {
            Some(token) if auth.verify(&token) => Ok(RequireToken),
            _ => {
                warn!("Rejected unauthenticated request to {}", parts.uri.path());
                Err(ApiError::Unauthorized)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_is_exact() {
        let auth = TokenAuth::new("secret");
        assert!(auth.verify("secret"));
        assert!(!auth.verify("secret2"));
        assert!(!auth.verify("secre"));
        assert!(!auth.verify(""));
    }
}
