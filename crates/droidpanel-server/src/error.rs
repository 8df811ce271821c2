use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::tasks::{ClearConflict, StartError};

/// Failures that cross the route boundary. Everything external-command
/// related is already captured into result records before it gets here;
/// these are the request-level rejections.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("no API key configured for provider {0}")]
    CredentialMissing(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = match &self {
            PanelError::BadRequest(_) | PanelError::CredentialMissing(_) => StatusCode::BAD_REQUEST,
            PanelError::Conflict(_) => StatusCode::CONFLICT,
            PanelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            success: false,
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<StartError> for PanelError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::AlreadyRunning => PanelError::Conflict(err.to_string()),
            StartError::EmptyTask => PanelError::BadRequest(err.to_string()),
            StartError::CredentialMissing(provider) => PanelError::CredentialMissing(provider),
        }
    }
}

impl From<ClearConflict> for PanelError {
    fn from(err: ClearConflict) -> Self {
        PanelError::Conflict(err.to_string())
    }
}

impl From<std::io::Error> for PanelError {
    fn from(err: std::io::Error) -> Self {
        PanelError::Internal(err.to_string())
    }
}
