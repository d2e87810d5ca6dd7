use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupHandle, delete_chunks};
use crate::error::{ReassemblyError, StoreError};
use crate::keys::ChunkLayout;
use crate::session::{SessionStore, StatusDetail, UploadStatus};
use crate::store::{ByteStream, ObjectStore, UploadOptions};

/// Log a fetch line every this many chunks.
const FETCH_LOG_INTERVAL: u32 = 10;

pub const DEFAULT_MAX_CHUNKS: u32 = 100_000;

#[derive(Clone, Debug)]
pub struct ReassemblyConfig {
    pub layout: ChunkLayout,
    /// Give up on a single chunk fetch after this long (None = wait forever)
    pub chunk_timeout: Option<Duration>,
    /// Keys per `delete_many` call during cleanup
    pub cleanup_batch_size: usize,
    /// Log cleanup progress every N chunks
    pub cleanup_log_every: usize,
    /// Content type recorded on the assembled object
    pub content_type: Option<String>,
    /// Requests claiming more chunks than this are rejected up front
    pub max_chunks: u32,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            layout: ChunkLayout::default(),
            chunk_timeout: None,
            cleanup_batch_size: 10,
            cleanup_log_every: 10,
            content_type: None,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassemblyRequest {
    pub session_id: String,
    pub file_name: String,
    pub total_chunks: u32,
}

impl ReassemblyRequest {
    pub fn new(session_id: impl Into<String>, file_name: impl Into<String>, total_chunks: u32) -> Self {
        Self {
            session_id: session_id.into(),
            file_name: file_name.into(),
            total_chunks,
        }
    }

    fn validate(&self, max_chunks: u32) -> Result<(), ReassemblyError> {
        ChunkLayout::validate_session_id(&self.session_id)?;
        if self.file_name.trim().is_empty() {
            return Err(ReassemblyError::InvalidRequest(
                "file name must not be empty".into(),
            ));
        }
        if self.total_chunks == 0 {
            return Err(ReassemblyError::InvalidRequest(
                "total_chunks must be at least 1".into(),
            ));
        }
        if self.total_chunks > max_chunks {
            return Err(ReassemblyError::InvalidRequest(format!(
                "total_chunks {} exceeds the limit of {}",
                self.total_chunks, max_chunks
            )));
        }
        Ok(())
    }
}

/// A successfully assembled object. Chunk deletion continues in the background.
#[derive(Debug)]
pub struct Reassembled {
    pub file_name: String,
    pub file_size: u64,
    pub cleanup: CleanupHandle,
}

/// Joins the chunks of an upload session into one object.
pub struct Reassembler {
    objects: Arc<dyn ObjectStore>,
    sessions: Arc<dyn SessionStore>,
    config: ReassemblyConfig,
    cleanups: TaskTracker,
}

impl Reassembler {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        config: ReassemblyConfig,
    ) -> Self {
        Self {
            objects,
            sessions,
            config,
            cleanups: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.config.layout
    }

    /// Number of chunk cleanups still running.
    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.len()
    }

    /// Wait until every background cleanup spawned so far has finished.
    pub async fn wait_for_cleanup(&self) {
        self.cleanups.close();
        self.cleanups.wait().await;
        self.cleanups.reopen();
    }

    /// Concatenate chunks `0..total_chunks` of the session into `file_name`.
    ///
    /// The session moves to `processing`, then to `completed` or `failed`.
    /// Chunks are only deleted after the destination object exists and the
    /// session is `completed`; that deletion never affects the result.
    ///
    /// Running again on a `completed` session rewrites the destination from
    /// whatever chunks are still stored, or fails on the first missing one. The
    /// session itself is left as it is and no cleanup is started. A `failed`
    /// or `processing` session is rejected with
    /// [`SessionStoreError::InvalidTransition`](crate::SessionStoreError::InvalidTransition).
    pub async fn reassemble(
        &self,
        request: &ReassemblyRequest,
    ) -> Result<Reassembled, ReassemblyError> {
        request.validate(self.config.max_chunks)?;
        let current = self.sessions.current_status(&request.session_id).await?;
        if current == UploadStatus::Completed {
            return self.rewrite_completed(request).await;
        }
        self.run(request).await
    }

    /// Like [`reassemble`](Self::reassemble), but only for a session that is
    /// still `uploading`. The `uploading -> processing` step is the claim: of
    /// several concurrent callers exactly one proceeds, the rest get
    /// [`SessionStoreError::InvalidTransition`](crate::SessionStoreError::InvalidTransition)
    /// and nothing is written for them.
    pub async fn reassemble_uploading(
        &self,
        request: &ReassemblyRequest,
    ) -> Result<Reassembled, ReassemblyError> {
        request.validate(self.config.max_chunks)?;
        self.run(request).await
    }

    async fn run(&self, request: &ReassemblyRequest) -> Result<Reassembled, ReassemblyError> {
        let session_id = request.session_id.as_str();

        self.sessions
            .set_status(session_id, UploadStatus::Processing, StatusDetail::default())
            .await?;

        info!(
            session_id,
            file_name = %request.file_name,
            total_chunks = request.total_chunks,
            "Reassembling upload"
        );
        let started = Instant::now();

        let file_size = match self.assemble(request).await {
            Ok(size) => size,
            Err(e) => {
                error!(session_id, "Reassembly failed: {}", e);
                if let Err(mark) = self
                    .sessions
                    .set_status(session_id, UploadStatus::Failed, StatusDetail::failed(e.to_string()))
                    .await
                {
                    error!(session_id, "Failed to mark session as failed: {}", mark);
                }
                return Err(e);
            }
        };

        self.sessions
            .set_status(
                session_id,
                UploadStatus::Completed,
                StatusDetail::completed(file_size),
            )
            .await?;

        info!(
            session_id,
            file_name = %request.file_name,
            file_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reassembly complete"
        );

        let keys = self
            .config
            .layout
            .chunk_keys(session_id, request.total_chunks);
        let task = self.cleanups.spawn(delete_chunks(
            self.objects.clone(),
            session_id.to_string(),
            keys,
            self.config.cleanup_batch_size,
            self.config.cleanup_log_every,
        ));

        Ok(Reassembled {
            file_name: request.file_name.clone(),
            file_size,
            cleanup: CleanupHandle::new(
                session_id.to_string(),
                request.total_chunks as usize,
                task,
            ),
        })
    }

    async fn rewrite_completed(
        &self,
        request: &ReassemblyRequest,
    ) -> Result<Reassembled, ReassemblyError> {
        let session_id = request.session_id.as_str();
        info!(
            session_id,
            file_name = %request.file_name,
            "Session already completed; rewriting destination from stored chunks"
        );

        let file_size = self.assemble(request).await.inspect_err(|e| {
            warn!(session_id, "Rewrite of completed session failed: {}", e);
        })?;

        Ok(Reassembled {
            file_name: request.file_name.clone(),
            file_size,
            cleanup: CleanupHandle::skipped(session_id.to_string()),
        })
    }

    async fn assemble(&self, request: &ReassemblyRequest) -> Result<u64, ReassemblyError> {
        let source = ChunkSource::new(
            self.objects.clone(),
            self.config.layout.clone(),
            request,
            self.config.chunk_timeout,
        );
        let bytes_seen = source.bytes_seen.clone();
        let failure = source.failure.clone();

        let options = UploadOptions {
            overwrite: true,
            content_type: self.config.content_type.clone(),
        };
        let uploaded = self
            .objects
            .upload(&request.file_name, source.into_stream(), options)
            .await;

        // A chunk failure surfaces to the store as an aborted body; report the chunk
        if let Some(chunk_error) = take_failure(&failure) {
            return Err(chunk_error);
        }

        match uploaded {
            Ok(written) => {
                let seen = bytes_seen.load(Ordering::SeqCst);
                if written != seen {
                    debug!(written, seen, "Store reported a different size than streamed");
                }
                Ok(seen)
            }
            Err(source) => Err(ReassemblyError::Upload {
                file_name: request.file_name.clone(),
                source,
            }),
        }
    }
}

fn take_failure(slot: &Mutex<Option<ReassemblyError>>) -> Option<ReassemblyError> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Lazily fetches chunks in index order, one per poll of the resulting stream.
/// Keys are derived per index, so memory does not grow with `total`.
struct ChunkSource {
    objects: Arc<dyn ObjectStore>,
    layout: ChunkLayout,
    session_id: String,
    total: u32,
    next: u32,
    timeout: Option<Duration>,
    bytes_seen: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<ReassemblyError>>>,
    stopped: bool,
}

impl ChunkSource {
    fn new(
        objects: Arc<dyn ObjectStore>,
        layout: ChunkLayout,
        request: &ReassemblyRequest,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            objects,
            layout,
            session_id: request.session_id.clone(),
            total: request.total_chunks,
            next: 0,
            timeout,
            bytes_seen: Arc::new(AtomicU64::new(0)),
            failure: Arc::new(Mutex::new(None)),
            stopped: false,
        }
    }

    async fn fetch(&self, index: u32) -> Result<Bytes, ReassemblyError> {
        let key = self.layout.chunk_key(&self.session_id, index);
        let download = self.objects.download(&key);
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, download)
                .await
                .map_err(|_| ReassemblyError::ChunkTimeout { index, timeout })?,
            None => download.await,
        };
        result.map_err(|source| ReassemblyError::MissingChunk { index, source })
    }

    fn record_failure(&self, err: ReassemblyError) {
        match self.failure.lock() {
            Ok(mut guard) => *guard = Some(err),
            Err(poisoned) => *poisoned.into_inner() = Some(err),
        }
    }

    fn into_stream(self) -> ByteStream {
        futures::stream::unfold(self, |mut source| async move {
            if source.stopped || source.next >= source.total {
                return None;
            }
            let index = source.next;
            match source.fetch(index).await {
                Ok(bytes) => {
                    let total = source
                        .bytes_seen
                        .fetch_add(bytes.len() as u64, Ordering::SeqCst)
                        + bytes.len() as u64;
                    if index % FETCH_LOG_INTERVAL == 0 {
                        debug!(
                            chunk = index,
                            of = source.total,
                            bytes_so_far = total,
                            "Streaming chunk"
                        );
                    }
                    source.next += 1;
                    Some((Ok(bytes), source))
                }
                Err(e) => {
                    source.stopped = true;
                    let message = e.to_string();
                    source.record_failure(e);
                    Some((Err(StoreError::Aborted(message)), source))
                }
            }
        })
        .boxed()
    }
}
