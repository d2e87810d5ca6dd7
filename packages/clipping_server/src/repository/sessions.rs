use anyhow::{Context, Result};
use chunk_reassembly::UploadStatus;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::models::UploadSession;

use super::UploadSessionRepository;

fn session_from_row(r: &SqliteRow) -> Result<UploadSession> {
    let status: String = r.get("status");
    Ok(UploadSession {
        session_id: r.get("session_id"),
        file_name: r.get("file_name"),
        total_chunks: r.get::<i64, _>("total_chunks") as u32,
        status: status.parse().map_err(anyhow::Error::msg)?,
        file_size: r.get::<Option<i64>, _>("file_size").map(|s| s as u64),
        error: r.get("error"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

impl UploadSessionRepository {
    pub async fn create_session(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (session_id, file_name, total_chunks, status, file_size, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.file_name)
        .bind(session.total_chunks as i64)
        .bind(session.status.as_str())
        .bind(session.file_size.map(|s| s as i64))
        .bind(&session.error)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create upload session")?;

        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, file_name, total_chunks, status, file_size, error, created_at, updated_at
            FROM upload_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    /// Move a session from `from` to `to`, recording size and error, but only
    /// if it is still in `from`. Returns the updated row, or None when the
    /// session is missing or has already moved on.
    pub async fn transition_status(
        &self,
        session_id: &str,
        from: UploadStatus,
        to: UploadStatus,
        file_size: Option<u64>,
        error: Option<&str>,
    ) -> Result<Option<UploadSession>> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = ?, file_size = ?, error = ?, updated_at = ?
            WHERE session_id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(file_size.map(|s| s as i64))
        .bind(error)
        .bind(now)
        .bind(session_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update upload session {}", session_id))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_session(session_id).await
    }

    pub async fn count_by_status(&self, status: UploadStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
