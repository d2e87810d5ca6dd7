use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chunk_reassembly::{ReassemblyError, SessionStoreError, StoreError};
use serde::Serialize;
use tracing::error;

/// Error returned by API handlers; renders as
/// `{error, message, retryable, new_session_required}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retryable: bool,
    /// The session is finished; retrying means creating a new one and
    /// uploading its chunks again
    pub new_session_required: bool,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Reassembly(e) => match e {
                ReassemblyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                ReassemblyError::Session(SessionStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                ReassemblyError::Session(SessionStoreError::InvalidTransition { .. }) => {
                    StatusCode::CONFLICT
                }
                ReassemblyError::ChunkTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Storage(StoreError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Reassembly(e) => e.error_code(),
            Self::Storage(e) => e.error_code(),
            Self::Internal(_) => "internal",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::Reassembly(e) => e.retryable(),
            Self::Storage(e) => !matches!(e, StoreError::InvalidKey(_)),
            Self::Internal(_) => true,
            _ => false,
        }
    }

    pub fn new_session_required(&self) -> bool {
        matches!(self, Self::Reassembly(e) if e.ends_session())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.error_code(), "Request failed: {:#}", self);
        }
        let body = ErrorBody {
            error: self.error_code().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
            new_session_required: self.new_session_required(),
        };
        (status, Json(body)).into_response()
    }
}
