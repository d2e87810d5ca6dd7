use chunk_reassembly::UploadStatus;
use serde::{Deserialize, Serialize};

/// One row of `upload_sessions`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadSession {
    pub fn new(session_id: String, file_name: String, total_chunks: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            session_id,
            file_name,
            total_chunks,
            status: UploadStatus::Uploading,
            file_size: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUploadRequest {
    pub file_name: String,
    pub total_chunks: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUploadResponse {
    pub session_id: String,
    pub status: UploadStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkStored {
    pub session_id: String,
    pub index: u32,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub file_name: String,
    pub file_size: u64,
}
