use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chunk_reassembly::{
    ChunkLayout, ReassemblyError, ReassemblyRequest, SessionStoreError, UploadOptions, UploadStatus,
};
use tracing::{debug, error, info};

use crate::AppState;
use crate::error::ApiError;
use crate::models::{
    ChunkStored, CompleteUploadResponse, CreateUploadRequest, CreateUploadResponse, UploadSession,
};

fn validate_file_name(file_name: &str) -> Result<(), ApiError> {
    let bad = file_name.trim().is_empty()
        || file_name.starts_with('/')
        || file_name.contains('\\')
        || file_name.split('/').any(|part| part.is_empty() || part == "..");
    if bad {
        return Err(ApiError::BadRequest(format!(
            "invalid file name: {:?}",
            file_name
        )));
    }
    Ok(())
}

async fn load_session(state: &AppState, session_id: &str) -> Result<UploadSession, ApiError> {
    state
        .sessions
        .get(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload session {} not found", session_id)))
}

fn require_uploading(session: &UploadSession) -> Result<(), ApiError> {
    if session.status != UploadStatus::Uploading {
        return Err(ApiError::Conflict(format!(
            "upload session {} is {}",
            session.session_id, session.status
        )));
    }
    Ok(())
}

pub async fn create_upload(
    State(state): State<AppState>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_file_name(&req.file_name)?;
    if req.total_chunks == 0 {
        return Err(ApiError::BadRequest(
            "total_chunks must be at least 1".into(),
        ));
    }
    let max_chunks = state.reassembler.config().max_chunks;
    if req.total_chunks > max_chunks {
        return Err(ApiError::BadRequest(format!(
            "total_chunks {} exceeds the limit of {}",
            req.total_chunks, max_chunks
        )));
    }

    let session = state.sessions.create(req.file_name, req.total_chunks).await?;
    info!(
        session_id = %session.session_id,
        file_name = %session.file_name,
        total_chunks = session.total_chunks,
        "Upload session created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateUploadResponse {
            session_id: session.session_id,
            status: session.status,
        }),
    ))
}

pub async fn put_chunk(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> Result<Json<ChunkStored>, ApiError> {
    ChunkLayout::validate_session_id(&session_id)?;
    let session = load_session(&state, &session_id).await?;
    require_uploading(&session)?;
    if index >= session.total_chunks {
        return Err(ApiError::BadRequest(format!(
            "chunk index {} out of range (session has {} chunks)",
            index, session.total_chunks
        )));
    }

    let key = state.reassembler.layout().chunk_key(&session_id, index);
    let size = state
        .objects
        .put(&key, body, UploadOptions::overwrite())
        .await?;
    state.metrics.chunk_stored();
    debug!(session_id = %session_id, index, size, "Stored chunk");

    Ok(Json(ChunkStored {
        session_id,
        index,
        size,
    }))
}

pub async fn complete_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CompleteUploadResponse>, ApiError> {
    let session = load_session(&state, &session_id).await?;
    require_uploading(&session)?;

    let request = ReassemblyRequest::new(&session_id, &session.file_name, session.total_chunks);

    // The uploading -> processing write is the claim; a concurrent caller that
    // loses it gets a 409 and touches nothing.
    let result = state.reassembler.reassemble_uploading(&request).await;
    if let Err(ReassemblyError::Session(SessionStoreError::InvalidTransition { from, .. })) =
        &result
    {
        debug!(session_id = %session_id, %from, "Completion already claimed");
        return Err(ApiError::Conflict(format!(
            "upload session {} is {}",
            session_id, from
        )));
    }
    state.metrics.reassembly_started();

    match result {
        Ok(done) => {
            state.metrics.reassembly_completed(done.file_size);

            let metrics = state.metrics.clone();
            let cleanup = done.cleanup;
            tokio::spawn(async move {
                let report = cleanup.wait().await;
                metrics.cleanup_finished(report.deleted, report.failed);
            });

            Ok(Json(CompleteUploadResponse {
                file_name: done.file_name,
                file_size: done.file_size,
            }))
        }
        Err(e) => {
            state.metrics.reassembly_failed();
            error!(
                session_id = %session_id,
                code = e.error_code(),
                failed_chunk = ?e.failed_chunk(),
                "Reassembly failed: {}",
                e
            );
            Err(e.into())
        }
    }
}

pub async fn get_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<UploadSession>, ApiError> {
    Ok(Json(load_session(&state, &session_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{read_json, test_app_state};
    use axum::{
        Router,
        body::Body,
        http::Request,
        routing::{get, post, put},
    };
    use chunk_reassembly::ObjectStore;
    use tower::ServiceExt;

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/uploads", post(create_upload))
            .route("/uploads/{id}", get(get_upload))
            .route("/uploads/{id}/chunks/{index}", put(put_chunk))
            .route("/uploads/{id}/complete", post(complete_upload))
            .with_state(state)
    }

    async fn create(app: &Router, file_name: &str, total_chunks: u32) -> String {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/uploads")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"file_name": file_name, "total_chunks": total_chunks})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = read_json(resp).await;
        assert_eq!(json["status"], "uploading");
        json["session_id"].as_str().unwrap().to_string()
    }

    async fn send_chunk(app: &Router, id: &str, index: u32, data: Vec<u8>) -> StatusCode {
        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/uploads/{}/chunks/{}", id, index))
                    .body(Body::from(data))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    async fn complete(app: &Router, id: &str) -> axum::response::Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/uploads/{}/complete", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn fetch(app: &Router, id: &str) -> serde_json::Value {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/uploads/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        read_json(resp).await
    }

    #[tokio::test]
    async fn test_full_upload_flow() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state.clone());
        let id = create(&app, "clip.mp4", 3).await;

        // out of order upload is fine
        for (i, fill) in [(2u32, b'c'), (0, b'a'), (1, b'b')] {
            assert_eq!(send_chunk(&app, &id, i, vec![fill; 1024]).await, StatusCode::OK);
        }

        let resp = complete(&app, &id).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = read_json(resp).await;
        assert_eq!(json["file_name"], "clip.mp4");
        assert_eq!(json["file_size"], 3072);

        let stored = state.objects.download("clip.mp4").await.unwrap();
        assert_eq!(&stored[..1024], &[b'a'; 1024][..]);
        assert_eq!(&stored[2048..], &[b'c'; 1024][..]);

        let session = fetch(&app, &id).await;
        assert_eq!(session["status"], "completed");
        assert_eq!(session["file_size"], 3072);

        state.reassembler.wait_for_cleanup().await;
        let key = state.reassembler.layout().chunk_key(&id, 0);
        assert!(!state.objects.exists(&key).await.unwrap());
        assert_eq!(state.metrics.snapshot().reassembly.completed, 1);
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_session() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state.clone());
        let id = create(&app, "partial.bin", 2).await;
        send_chunk(&app, &id, 0, vec![1; 10]).await;

        let resp = complete(&app, &id).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = read_json(resp).await;
        assert_eq!(json["error"], "missing_chunk");
        assert_eq!(json["retryable"], true);

        let session = fetch(&app, &id).await;
        assert_eq!(session["status"], "failed");
        assert!(session["error"].as_str().unwrap().contains("chunk 1"));
        assert!(!state.objects.exists("partial.bin").await.unwrap());
        assert_eq!(state.metrics.snapshot().reassembly.failed, 1);
    }

    #[tokio::test]
    async fn test_failed_completion_needs_new_session() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state.clone());
        let id = create(&app, "retry.bin", 2).await;
        send_chunk(&app, &id, 0, vec![1; 8]).await;

        let resp = complete(&app, &id).await;
        let json = read_json(resp).await;
        assert_eq!(json["retryable"], true);
        assert_eq!(json["new_session_required"], true);

        // the failed session accepts nothing more
        assert_eq!(send_chunk(&app, &id, 1, vec![2; 8]).await, StatusCode::CONFLICT);
        let resp = complete(&app, &id).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(read_json(resp).await["new_session_required"], false);
        assert_eq!(fetch(&app, &id).await["status"], "failed");

        // a fresh session with all chunks succeeds
        let fresh = create(&app, "retry.bin", 2).await;
        send_chunk(&app, &fresh, 0, vec![1; 8]).await;
        send_chunk(&app, &fresh, 1, vec![2; 8]).await;
        assert_eq!(complete(&app, &fresh).await.status(), StatusCode::OK);
        assert_eq!(state.objects.download("retry.bin").await.unwrap().len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completes_run_once() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state.clone());

        for round in 0..20 {
            let id = create(&app, &format!("race-{}.bin", round), 2).await;
            send_chunk(&app, &id, 0, vec![b'a'; 16]).await;
            send_chunk(&app, &id, 1, vec![b'b'; 16]).await;

            let calls: Vec<_> = (0..2)
                .map(|_| {
                    let app = app.clone();
                    let id = id.clone();
                    tokio::spawn(async move { complete(&app, &id).await.status() })
                })
                .collect();
            let mut statuses = Vec::new();
            for call in calls {
                statuses.push(call.await.unwrap());
            }
            statuses.sort();

            assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT], "round {}", round);
            state.reassembler.wait_for_cleanup().await;
            let session = fetch(&app, &id).await;
            assert_eq!(session["status"], "completed", "round {}", round);
            assert_eq!(session["file_size"], 32);
        }
        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.reassembly.completed, 20);
        assert_eq!(snapshot.reassembly.failed, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_too_many_chunks() {
        let (state, _tmp) = test_app_state().await;
        let limit = state.reassembler.config().max_chunks;
        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/uploads")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"file_name": "big.bin", "total_chunks": limit + 1})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(
            read_json(resp).await["message"]
                .as_str()
                .unwrap()
                .contains("exceeds the limit")
        );
    }

    #[tokio::test]
    async fn test_complete_twice_conflicts() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state);
        let id = create(&app, "once.bin", 1).await;
        send_chunk(&app, &id, 0, vec![9; 4]).await;

        assert_eq!(complete(&app, &id).await.status(), StatusCode::OK);
        assert_eq!(complete(&app, &id).await.status(), StatusCode::CONFLICT);
        assert_eq!(send_chunk(&app, &id, 0, vec![1]).await, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_chunk_index_out_of_range() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state);
        let id = create(&app, "a.bin", 2).await;
        assert_eq!(send_chunk(&app, &id, 2, vec![0]).await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state);
        assert_eq!(send_chunk(&app, "nope", 0, vec![0]).await, StatusCode::NOT_FOUND);
        assert_eq!(complete(&app, "nope").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let (state, _tmp) = test_app_state().await;
        let app = router(state);
        for body in [
            serde_json::json!({"file_name": "ok.bin", "total_chunks": 0}),
            serde_json::json!({"file_name": "", "total_chunks": 1}),
            serde_json::json!({"file_name": "../etc/passwd", "total_chunks": 1}),
        ] {
            let resp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/uploads")
                        .header("content-type", "application/json")
                        .body(Body::from(body.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {}", body);
        }
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("clips/2024/a.mp4").is_ok());
        assert!(validate_file_name("/abs").is_err());
        assert!(validate_file_name("a//b").is_err());
        assert!(validate_file_name("a\\b").is_err());
    }
}
