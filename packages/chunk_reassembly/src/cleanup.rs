use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::ObjectStore;

/// Outcome of deleting a session's chunk objects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub total: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.deleted == self.total
    }
}

/// Handle to background chunk deletion.
///
/// Await it with [`CleanupHandle::wait`] or drop it; dropping does not cancel
/// the deletion.
#[derive(Debug)]
pub struct CleanupHandle {
    session_id: String,
    total: usize,
    task: Option<JoinHandle<CleanupReport>>,
}

impl CleanupHandle {
    pub(crate) fn new(session_id: String, total: usize, task: JoinHandle<CleanupReport>) -> Self {
        Self {
            session_id,
            total,
            task: Some(task),
        }
    }

    /// No deletion was started; chunks belong to an earlier run.
    pub(crate) fn skipped(session_id: String) -> Self {
        Self {
            session_id,
            total: 0,
            task: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    pub async fn wait(self) -> CleanupReport {
        let Some(task) = self.task else {
            return CleanupReport::default();
        };
        match task.await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    "Chunk cleanup task did not finish: {}", e
                );
                CleanupReport {
                    total: self.total,
                    deleted: 0,
                    failed: self.total,
                }
            }
        }
    }
}

/// Delete `keys` in batches of `batch_size`, logging progress every `log_every`
/// chunks. Keys are pulled from the iterator one batch at a time. Failures are
/// counted and logged, never returned.
pub(crate) async fn delete_chunks<I>(
    store: Arc<dyn ObjectStore>,
    session_id: String,
    keys: I,
    batch_size: usize,
    log_every: usize,
) -> CleanupReport
where
    I: Iterator<Item = String> + Send + 'static,
{
    let batch_size = batch_size.max(1);
    let log_every = log_every.max(1);
    let mut keys = keys;
    let mut report = CleanupReport {
        total: keys.size_hint().0,
        ..Default::default()
    };

    loop {
        let batch: Vec<String> = keys.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }
        let before = report.deleted + report.failed;
        match store.delete_many(&batch).await {
            Ok(()) => report.deleted += batch.len(),
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    first_key = %batch[0],
                    "Failed to delete {} chunk(s): {}", batch.len(), e
                );
                report.failed += batch.len();
            }
        }

        let processed = report.deleted + report.failed;
        if processed / log_every > before / log_every {
            info!(
                session_id = %session_id,
                "Chunk cleanup progress: {}/{} processed", processed, report.total
            );
        } else {
            debug!(session_id = %session_id, processed, total = report.total, "Chunk batch deleted");
        }
    }
    report.total = report.deleted + report.failed;

    if report.failed > 0 {
        warn!(
            session_id = %session_id,
            "Chunk cleanup finished with {} failure(s) ({} deleted)", report.failed, report.deleted
        );
    } else {
        info!(session_id = %session_id, "Deleted {} chunk(s)", report.deleted);
    }
    report
}
