use sqlx::sqlite::SqlitePoolOptions;

/// Fresh repository backed by an isolated in-memory SQLite database with migrations applied.
pub async fn test_repository() -> super::UploadSessionRepository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    super::UploadSessionRepository::new(pool)
}
