//! Server metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Reassembly
    pub reassemblies_started: AtomicU64,
    pub reassemblies_completed: AtomicU64,
    pub reassemblies_failed: AtomicU64,
    /// Bytes written to assembled objects
    pub bytes_assembled: AtomicU64,
    /// Chunk objects accepted via the upload API
    pub chunks_stored: AtomicU64,

    // Cleanup
    pub cleanup_deleted: AtomicU64,
    pub cleanup_failed: AtomicU64,

    // Realtime
    pub channel_errors: AtomicU64,
    pub connection_state_changes: AtomicU64,
    /// Currently open WebSocket clients
    pub active_ws_clients: AtomicU64,
    pub total_ws_clients: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn reassembly_started(&self) {
        self.reassemblies_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reassembly_completed(&self, bytes: u64) {
        self.reassemblies_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_assembled.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reassembly_failed(&self) {
        self.reassemblies_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_stored(&self) {
        self.chunks_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cleanup_finished(&self, deleted: usize, failed: usize) {
        self.cleanup_deleted
            .fetch_add(deleted as u64, Ordering::Relaxed);
        self.cleanup_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn channel_error(&self) {
        self.channel_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_state_changed(&self) {
        self.connection_state_changes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_client_opened(&self) {
        self.active_ws_clients.fetch_add(1, Ordering::Relaxed);
        self.total_ws_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_client_closed(&self) {
        self.active_ws_clients.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            reassembly: ReassemblyMetrics {
                started: self.reassemblies_started.load(Ordering::Relaxed),
                completed: self.reassemblies_completed.load(Ordering::Relaxed),
                failed: self.reassemblies_failed.load(Ordering::Relaxed),
                bytes_assembled: self.bytes_assembled.load(Ordering::Relaxed),
                chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            },
            cleanup: CleanupMetrics {
                deleted: self.cleanup_deleted.load(Ordering::Relaxed),
                failed: self.cleanup_failed.load(Ordering::Relaxed),
            },
            realtime: RealtimeMetrics {
                channel_errors: self.channel_errors.load(Ordering::Relaxed),
                connection_state_changes: self.connection_state_changes.load(Ordering::Relaxed),
                active_ws_clients: self.active_ws_clients.load(Ordering::Relaxed),
                total_ws_clients: self.total_ws_clients.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub reassembly: ReassemblyMetrics,
    pub cleanup: CleanupMetrics,
    pub realtime: RealtimeMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblyMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_assembled: u64,
    pub chunks_stored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupMetrics {
    pub deleted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMetrics {
    pub channel_errors: u64,
    pub connection_state_changes: u64,
    pub active_ws_clients: u64,
    pub total_ws_clients: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub realtime: RealtimeHealth,
    pub sessions: SessionHealth,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeHealth {
    pub channels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub processing: u64,
    pub failed: u64,
    pub pending_cleanups: usize,
}
