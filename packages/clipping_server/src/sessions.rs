//! Upload session bookkeeping that mirrors every change onto the realtime hub.

use anyhow::Result;
use async_trait::async_trait;
use chunk_reassembly::{SessionStore, SessionStoreError, StatusDetail, UploadStatus};
use realtime_mux::{ChangeEvent, LocalRealtime};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::UploadSession;
use crate::repository::UploadSessionRepository;

pub const SESSIONS_SCHEMA: &str = "public";
pub const SESSIONS_TABLE: &str = "upload_sessions";

pub struct SessionTracker {
    repository: Arc<UploadSessionRepository>,
    realtime: Arc<LocalRealtime>,
}

fn to_row(session: &UploadSession) -> serde_json::Value {
    serde_json::to_value(session).unwrap_or(serde_json::Value::Null)
}

impl SessionTracker {
    pub fn new(repository: Arc<UploadSessionRepository>, realtime: Arc<LocalRealtime>) -> Self {
        Self {
            repository,
            realtime,
        }
    }

    pub async fn create(&self, file_name: String, total_chunks: u32) -> Result<UploadSession> {
        let session = UploadSession::new(Uuid::now_v7().to_string(), file_name, total_chunks);
        self.repository.create_session(&session).await?;
        debug!(session_id = %session.session_id, total_chunks, "Created upload session");

        self.realtime.publish(ChangeEvent::insert(
            SESSIONS_SCHEMA,
            SESSIONS_TABLE,
            to_row(&session),
        ));
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<UploadSession>> {
        self.repository.get_session(session_id).await
    }
}

#[async_trait]
impl SessionStore for SessionTracker {
    async fn current_status(&self, session_id: &str) -> Result<UploadStatus, SessionStoreError> {
        self.repository
            .get_session(session_id)
            .await
            .map_err(backend)?
            .map(|session| session.status)
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: UploadStatus,
        detail: StatusDetail,
    ) -> Result<(), SessionStoreError> {
        let old = self
            .repository
            .get_session(session_id)
            .await
            .map_err(backend)?
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;

        let rejected = |from: UploadStatus| {
            warn!(session_id, %from, to = %status, "Rejected upload status transition");
            SessionStoreError::InvalidTransition {
                session_id: session_id.to_string(),
                from,
                to: status,
            }
        };
        if !old.status.can_transition_to(status) {
            return Err(rejected(old.status));
        }

        let updated = self
            .repository
            .transition_status(
                session_id,
                old.status,
                status,
                detail.file_size,
                detail.error.as_deref(),
            )
            .await
            .map_err(backend)?;
        let Some(new) = updated else {
            // Someone else moved the row between the read and the update
            let current = self.current_status(session_id).await?;
            return Err(rejected(current));
        };

        self.realtime.publish(ChangeEvent::update(
            SESSIONS_SCHEMA,
            SESSIONS_TABLE,
            to_row(&old),
            to_row(&new),
        ));
        Ok(())
    }
}

fn backend(e: anyhow::Error) -> SessionStoreError {
    SessionStoreError::Backend(format!("{:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers::test_repository;
    use realtime_mux::{
        ChangeType, Channel, ChannelOptions, ChannelProvider, SubscribeStatus, SubscriptionKey,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn tracker_with_listener() -> (SessionTracker, mpsc::UnboundedReceiver<ChangeEvent>) {
        let hub = Arc::new(LocalRealtime::default());
        let channel = hub.create_channel("channel:test", &ChannelOptions::default());
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_change(
            &SubscriptionKey::new(SESSIONS_SCHEMA, SESSIONS_TABLE),
            Arc::new(move |e: &ChangeEvent| {
                let _ = tx.send(e.clone());
            }),
        );
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        channel.subscribe(Arc::new(move |s: SubscribeStatus| {
            let _ = ready_tx.send(s);
        }));
        ready_rx.recv().await.unwrap();

        let tracker = SessionTracker::new(Arc::new(test_repository().await), hub);
        (tracker, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_publishes_insert() {
        let (tracker, mut rx) = tracker_with_listener().await;
        let session = tracker.create("clip.mp4".into(), 4).await.unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);

        let event = next(&mut rx).await;
        assert_eq!(event.change, ChangeType::Insert);
        assert_eq!(event.new["session_id"], session.session_id.as_str());
    }

    #[tokio::test]
    async fn test_set_status_persists_and_publishes_update() {
        let (tracker, mut rx) = tracker_with_listener().await;
        let session = tracker.create("clip.mp4".into(), 4).await.unwrap();
        next(&mut rx).await;

        tracker
            .set_status(&session.session_id, UploadStatus::Processing, StatusDetail::default())
            .await
            .unwrap();
        tracker
            .set_status(&session.session_id, UploadStatus::Completed, StatusDetail::completed(99))
            .await
            .unwrap();

        let first = next(&mut rx).await;
        assert_eq!(first.change, ChangeType::Update);
        assert_eq!(first.old["status"], "uploading");
        assert_eq!(first.new["status"], "processing");

        let second = next(&mut rx).await;
        assert_eq!(second.new["status"], "completed");
        assert_eq!(second.new["file_size"], 99);

        let stored = tracker.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_set_status_unknown_session() {
        let (tracker, _rx) = tracker_with_listener().await;
        let err = tracker
            .set_status("nope", UploadStatus::Processing, StatusDetail::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_finished_session_cannot_be_reopened() {
        let (tracker, mut rx) = tracker_with_listener().await;
        let session = tracker.create("clip.mp4".into(), 1).await.unwrap();
        next(&mut rx).await;
        let id = session.session_id.as_str();

        tracker
            .set_status(id, UploadStatus::Processing, StatusDetail::default())
            .await
            .unwrap();
        tracker
            .set_status(id, UploadStatus::Completed, StatusDetail::completed(5))
            .await
            .unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        let err = tracker
            .set_status(id, UploadStatus::Processing, StatusDetail::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionStoreError::InvalidTransition {
                from: UploadStatus::Completed,
                ..
            }
        ));
        let stored = tracker.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Completed);
        assert_eq!(stored.file_size, Some(5));
        // nothing published for the rejected change
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let (tracker, _rx) = tracker_with_listener().await;
        let tracker = Arc::new(tracker);
        let session = tracker.create("clip.mp4".into(), 1).await.unwrap();

        let claims: Vec<_> = (0..6)
            .map(|_| {
                let tracker = tracker.clone();
                let id = session.session_id.clone();
                tokio::spawn(async move {
                    tracker
                        .set_status(&id, UploadStatus::Processing, StatusDetail::default())
                        .await
                })
            })
            .collect();

        let mut won = 0;
        for claim in claims {
            match claim.await.unwrap() {
                Ok(()) => won += 1,
                Err(e) => assert!(matches!(e, SessionStoreError::InvalidTransition { .. })),
            }
        }
        assert_eq!(won, 1);
    }
}
