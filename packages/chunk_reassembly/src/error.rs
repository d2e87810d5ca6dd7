use std::time::Duration;

use crate::session::UploadStatus;

/// Errors reported by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// The body stream handed to `upload` was aborted by its producer.
    #[error("upload body aborted: {0}")]
    Aborted(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidKey(_) => "invalid_key",
            Self::Aborted(_) => "aborted",
            Self::Io(_) => "io",
            Self::Backend(_) => "backend",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors reported by a [`SessionStore`](crate::SessionStore).
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("upload session not found: {0}")]
    NotFound(String),

    /// The session is not in a state that allows the requested status. Nothing
    /// was written.
    #[error("upload session {session_id} cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("session store error: {0}")]
    Backend(String),
}

/// Why a reassembly did not produce the destination object.
#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("invalid reassembly request: {0}")]
    InvalidRequest(String),

    #[error("chunk {index} could not be fetched: {source}")]
    MissingChunk {
        index: u32,
        #[source]
        source: StoreError,
    },

    #[error("chunk {index} timed out after {timeout:?}")]
    ChunkTimeout { index: u32, timeout: Duration },

    #[error("failed to write {file_name}: {source}")]
    Upload {
        file_name: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Session(#[from] SessionStoreError),
}

impl ReassemblyError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::MissingChunk { .. } => "missing_chunk",
            Self::ChunkTimeout { .. } => "chunk_timeout",
            Self::Upload { .. } => "upload_failed",
            Self::Session(SessionStoreError::NotFound(_)) => "session_not_found",
            Self::Session(SessionStoreError::InvalidTransition { .. }) => "invalid_transition",
            Self::Session(_) => "session_store",
        }
    }

    /// Index of the chunk that aborted the run, if a chunk was at fault.
    pub fn failed_chunk(&self) -> Option<u32> {
        match self {
            Self::MissingChunk { index, .. } | Self::ChunkTimeout { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether the caller can reasonably try again. When [`ends_session`] is
    /// also true, the retry needs a new session with its chunks re-uploaded.
    ///
    /// [`ends_session`]: ReassemblyError::ends_session
    pub fn retryable(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => false,
            Self::Session(SessionStoreError::NotFound(_)) => false,
            Self::Session(SessionStoreError::InvalidTransition { .. }) => false,
            _ => true,
        }
    }

    /// The run got past `processing`, so the session is terminal and cannot be
    /// completed again.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Self::MissingChunk { .. } | Self::ChunkTimeout { .. } | Self::Upload { .. }
        )
    }
}
