use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;

use crate::error::SessionStoreError;

/// Lifecycle of a multi-chunk upload.
///
/// `uploading -> processing -> completed | failed`; the last two are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (Self::Uploading, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown upload status: {}", other)),
        }
    }
}

/// Extra information recorded alongside a status change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusDetail {
    pub file_size: Option<u64>,
    pub error: Option<String>,
}

impl StatusDetail {
    pub fn completed(file_size: u64) -> Self {
        Self {
            file_size: Some(file_size),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            file_size: None,
            error: Some(error.into()),
        }
    }
}

/// Where upload sessions are persisted. The reassembler writes to it twice per
/// run: `processing` on start, then `completed` or `failed`.
///
/// `set_status` is a compare-and-set against the current status: it must
/// fail with [`SessionStoreError::InvalidTransition`] and write nothing when
/// `current.can_transition_to(status)` is false, and the check and the write
/// must be atomic with respect to other callers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn current_status(&self, session_id: &str) -> Result<UploadStatus, SessionStoreError>;

    async fn set_status(
        &self,
        session_id: &str,
        status: UploadStatus,
        detail: StatusDetail,
    ) -> Result<(), SessionStoreError>;
}

#[derive(Clone, Debug)]
struct SessionRecord {
    history: Vec<UploadStatus>,
    detail: StatusDetail,
}

/// Session store kept in memory; remembers every status a session went through.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session in the `uploading` state.
    pub async fn create(&self, session_id: &str) {
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionRecord {
                history: vec![UploadStatus::Uploading],
                detail: StatusDetail::default(),
            },
        );
    }

    pub async fn status(&self, session_id: &str) -> Option<UploadStatus> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.history.last().copied())
    }

    pub async fn history(&self, session_id: &str) -> Vec<UploadStatus> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    pub async fn detail(&self, session_id: &str) -> Option<StatusDetail> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.detail.clone())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn current_status(&self, session_id: &str) -> Result<UploadStatus, SessionStoreError> {
        self.status(session_id)
            .await
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: UploadStatus,
        detail: StatusDetail,
    ) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;
        let current = record.history.last().copied().unwrap_or(UploadStatus::Uploading);
        if !current.can_transition_to(status) {
            return Err(SessionStoreError::InvalidTransition {
                session_id: session_id.to_string(),
                from: current,
                to: status,
            });
        }
        record.history.push(status);
        record.detail = detail;
        Ok(())
    }
}
