use anyhow::{Context, Result};
use chunk_reassembly::{ChunkLayout, DEFAULT_CHUNK_PREFIX, DEFAULT_MAX_CHUNKS, ReassemblyConfig};
use realtime_mux::{DEFAULT_BROADCAST_CAPACITY, HealthSampling, MultiplexerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [reassembly]
//                    chunk_timeout_secs = 30
//
//   env var:         CLIPPING_REASSEMBLY__CHUNK_TIMEOUT_SECS=30   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub storage: StorageFileConfig,
    #[serde(default)]
    pub reassembly: ReassemblyFileConfig,
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Object storage (lives under `[storage]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageFileConfig {
    /// Root directory for stored objects; defaults to `<data_dir>/objects`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default = "default_chunk_prefix")]
    pub chunk_prefix: String,
}

impl Default for StorageFileConfig {
    fn default() -> Self {
        Self {
            root: None,
            chunk_prefix: default_chunk_prefix(),
        }
    }
}

/// Reassembly tunables (lives under `[reassembly]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReassemblyFileConfig {
    /// Per-chunk fetch timeout; 0 disables
    #[serde(default)]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,
    #[serde(default = "default_cleanup_log_every")]
    pub cleanup_log_every: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Largest `total_chunks` a new session may declare
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,
}

impl Default for ReassemblyFileConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: 0,
            cleanup_batch_size: default_cleanup_batch_size(),
            cleanup_log_every: default_cleanup_log_every(),
            content_type: None,
            max_chunks: default_max_chunks(),
        }
    }
}

/// Realtime tunables (lives under `[realtime]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default)]
    pub health_sampling: HealthSampling,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Outgoing events buffered per WebSocket client before it is dropped
    #[serde(default = "default_ws_queue_capacity")]
    pub ws_queue_capacity: usize,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: default_health_interval_ms(),
            health_sampling: HealthSampling::default(),
            broadcast_capacity: default_broadcast_capacity(),
            ws_queue_capacity: default_ws_queue_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_chunk_prefix() -> String {
    DEFAULT_CHUNK_PREFIX.to_string()
}
fn default_cleanup_batch_size() -> usize {
    10
}
fn default_cleanup_log_every() -> usize {
    10
}
fn default_max_chunks() -> u32 {
    DEFAULT_MAX_CHUNKS
}
fn default_health_interval_ms() -> u64 {
    5000
}
fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}
fn default_ws_queue_capacity() -> usize {
    100
}

/// Build a figment that layers: defaults → config.toml → CLIPPING_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CLIPPING_SERVER__PORT=9000`  →  `server.port = 9000`
///   `CLIPPING_REALTIME__HEALTH_SAMPLING=sample_one`  →  `realtime.health_sampling = "sample_one"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CLIPPING_").split("__"))
}

// =============================================================================
// Runtime views (derived from FileConfig)
// =============================================================================

pub fn reassembly_config(fc: &FileConfig) -> ReassemblyConfig {
    let r = &fc.reassembly;
    ReassemblyConfig {
        layout: ChunkLayout::new(fc.storage.chunk_prefix.clone()),
        chunk_timeout: if r.chunk_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(r.chunk_timeout_secs))
        },
        cleanup_batch_size: r.cleanup_batch_size,
        cleanup_log_every: r.cleanup_log_every,
        content_type: r.content_type.clone(),
        max_chunks: r.max_chunks,
    }
}

pub fn multiplexer_config(fc: &RealtimeFileConfig) -> MultiplexerConfig {
    MultiplexerConfig {
        health_interval: Duration::from_millis(fc.health_interval_ms.max(1)),
        health_sampling: fc.health_sampling,
        ..Default::default()
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClippingConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub objects_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ClippingConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".clipping"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let objects_dir = data_dir.join("objects");
        std::fs::create_dir_all(&objects_dir)
            .with_context(|| format!("Failed to create objects directory: {:?}", objects_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let db_path = data_dir.join("clipping.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            objects_dir,
            logs_dir,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// `[storage] root` if set, else the default objects directory.
    pub fn storage_root(&self, storage: &StorageFileConfig) -> PathBuf {
        storage
            .root
            .clone()
            .unwrap_or_else(|| self.objects_dir.clone())
    }
}
