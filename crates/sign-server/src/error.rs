use axum::http::StatusCode;
use axum_core::response::{IntoResponse as AxumCoreIntoResponse, Response};
use eyre::Report;
use tracing::error;

use crate::codec::EnvelopeError;
use crate::documents::DocumentError;
use crate::server::ApiResponse;
use crate::signing::SigningError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Unexpected(#[from] Report),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("Signing backend is not available: {0}")]
    BackendUnavailable(String),
    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) | ServerError::Envelope(_) => StatusCode::BAD_REQUEST,
            ServerError::Signing(SigningError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ServerError::Document(DocumentError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            ServerError::Document(DocumentError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Trait implementation to convert this error into the JSON response envelope
impl AxumCoreIntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let msg = match &self {
            ServerError::Unexpected(report) => {
                error!(error = ?report, "unexpected server error");
                "Something wrong happened.".to_string()
            }
            other => {
                error!(error = %other, status = status.as_u16(), "request failed");
                other.to_string()
            }
        };
        ApiResponse::failure(status, msg).into_response()
    }
}
