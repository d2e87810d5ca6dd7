use std::sync::Arc;

use chunk_reassembly::{FsObjectStore, ObjectStore};

use crate::AppState;
use crate::config::{ClippingConfig, FileConfig};
use crate::db::Database;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database and a
/// filesystem object store under a temp dir.
///
/// Callers **must** hold the returned `TempDir` for the lifetime of the test.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = ClippingConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    let objects: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::new(config.objects_dir.clone()).expect("object store"));

    let state = AppState::new(config, FileConfig::default(), Database { pool }, objects);
    (state, tmp)
}

/// Read a response body as JSON.
pub async fn read_json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json body")
}
