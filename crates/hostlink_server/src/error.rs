//! HTTP error responses.
//!
//! Every failure is answered with a JSON body `{"error": "..."}`. Relay errors
//! keep their already-sanitized text; the status code follows the variant.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hostlink_core::RelayError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Relay(err) => match err {
                RelayError::AuthFailure | RelayError::NotAuthenticated => StatusCode::UNAUTHORIZED,
                RelayError::SandboxViolation => StatusCode::FORBIDDEN,
                RelayError::Capacity(_) => StatusCode::PAYLOAD_TOO_LARGE,
                RelayError::ConfigurationDenied(_) => StatusCode::FORBIDDEN,
                RelayError::Io("Not found") => StatusCode::NOT_FOUND,
                RelayError::Io("Permission denied") => StatusCode::FORBIDDEN,
                RelayError::Clipboard => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_errors_map_to_client_statuses() {
        let cases = [
            (RelayError::SandboxViolation, StatusCode::FORBIDDEN),
            (RelayError::capacity("File too large"), StatusCode::PAYLOAD_TOO_LARGE),
            (RelayError::Io("Not found"), StatusCode::NOT_FOUND),
            (RelayError::Io("Not a file"), StatusCode::BAD_REQUEST),
            (RelayError::protocol("Invalid file name"), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn display_is_the_wire_text() {
        assert_eq!(ApiError::from(RelayError::SandboxViolation).to_string(), "Path outside sandbox");
        assert_eq!(ApiError::Unauthorized.to_string(), "Unauthorized");
    }
}
