// Repository layer. Upload session persistence lives in `sessions.rs` as
// `impl UploadSessionRepository`.

use sqlx::sqlite::SqlitePool;

mod sessions;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct UploadSessionRepository {
    pub(crate) pool: SqlitePool,
}

impl UploadSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
