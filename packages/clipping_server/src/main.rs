use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post, put},
};
use chunk_reassembly::{FsObjectStore, ObjectStore, Reassembler};
use clap::{Parser, Subcommand};
use realtime_mux::{LocalRealtime, Multiplexer};
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod error;
mod handlers;
mod metrics;
mod models;
mod repository;
mod sessions;
#[cfg(test)]
mod test_helpers;

use crate::config::{ClippingConfig, FileConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::UploadSessionRepository;
use crate::sessions::SessionTracker;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "clipd")]
#[command(about = "Chunked clip upload service with realtime session updates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.clipping)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server in the foreground
    Serve(ServeArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (overrides [server] port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides [server] host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
#[allow(dead_code)]
pub(crate) struct AppState {
    pub config: Arc<ClippingConfig>,
    pub file_config: Arc<FileConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub repository: Arc<UploadSessionRepository>,
    pub sessions: Arc<SessionTracker>,
    pub objects: Arc<dyn ObjectStore>,
    pub reassembler: Arc<Reassembler>,
    /// In-process realtime hub that session changes are published on
    pub realtime: Arc<LocalRealtime>,
    pub multiplexer: Multiplexer,
}

impl AppState {
    pub fn new(
        config: ClippingConfig,
        file_config: FileConfig,
        db: Database,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let realtime = Arc::new(LocalRealtime::new(file_config.realtime.broadcast_capacity));
        let multiplexer = Multiplexer::new(
            realtime.clone(),
            config::multiplexer_config(&file_config.realtime),
        );

        let repository = Arc::new(UploadSessionRepository::new(db.pool.clone()));
        let sessions = Arc::new(SessionTracker::new(repository.clone(), realtime.clone()));
        let reassembler = Arc::new(Reassembler::new(
            objects.clone(),
            sessions.clone(),
            config::reassembly_config(&file_config),
        ));

        Self {
            config: Arc::new(config),
            file_config: Arc::new(file_config),
            metrics: Arc::new(ServerMetrics::new()),
            db: Arc::new(db),
            repository,
            sessions,
            objects,
            reassembler,
            realtime,
            multiplexer,
        }
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/uploads", post(handlers::create_upload))
        .route("/api/uploads/{session_id}", get(handlers::get_upload))
        .route(
            "/api/uploads/{session_id}/chunks/{index}",
            put(handlers::put_chunk),
        )
        .route(
            "/api/uploads/{session_id}/complete",
            post(handlers::complete_upload),
        )
        .route(
            "/api/realtime/subscriptions",
            get(handlers::list_subscriptions),
        )
        .route("/api/realtime/ws", get(handlers::realtime_ws_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ClippingConfig::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_server(ServeArgs::default(), config).await,
        Some(Commands::Serve(args)) => run_server(args, config).await,
        Some(Commands::Config) => config_command(&config),
    }
}

fn resolve_file_config(config: &ClippingConfig) -> Result<FileConfig> {
    config::load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config.config_toml_path().display()))
}

fn config_command(config: &ClippingConfig) -> Result<()> {
    let file_config = resolve_file_config(config)?;
    let text = toml::to_string_pretty(&file_config).context("Failed to render configuration")?;
    println!("{}", text);
    Ok(())
}

async fn run_server(args: ServeArgs, config: ClippingConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "clipd=debug,clipping_server=debug,chunk_reassembly=debug,realtime_mux=debug,tower_http=debug,info"
    } else {
        "clipd=info,clipping_server=info,chunk_reassembly=info,realtime_mux=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting clipd");

    let mut file_config = resolve_file_config(&config)?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }

    let db = Database::new(&config).await?;
    let storage_root = config.storage_root(&file_config.storage);
    let objects: Arc<dyn ObjectStore> = Arc::new(
        FsObjectStore::new(&storage_root)
            .with_context(|| format!("Failed to open object store at {}", storage_root.display()))?,
    );
    info!("Object store: {}", storage_root.display());

    let addr = format!("{}:{}", file_config.server.host, file_config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;

    let state = AppState::new(config, file_config, db, objects);

    let metrics = state.metrics.clone();
    let _error_listener = state
        .multiplexer
        .add_error_listener(move |_| metrics.channel_error());
    let metrics = state.metrics.clone();
    let _connection_listener = state.multiplexer.add_connection_listener(move |s| {
        info!("Realtime connection is now {}", s);
        metrics.connection_state_changed();
    });
    let health_monitor = state.multiplexer.spawn_health_monitor();

    let multiplexer = state.multiplexer.clone();
    let reassembler = state.reassembler.clone();
    let db = state.db.clone();

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("clipd listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/uploads                          - Create upload session");
    info!("  PUT    /api/uploads/:id/chunks/:index        - Upload one chunk");
    info!("  POST   /api/uploads/:id/complete             - Reassemble chunks");
    info!("  GET    /api/uploads/:id                      - Poll session status");
    info!("  GET    /api/realtime/ws                      - Realtime change events");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    health_monitor.stop().await;
    let closed = multiplexer.close_all();
    info!("Closed {} realtime channel(s)", closed);

    let pending = reassembler.pending_cleanups();
    if pending > 0 {
        info!("Waiting for {} chunk cleanup(s)...", pending);
    }
    reassembler.wait_for_cleanup().await;
    db.pool.close().await;

    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{read_json, test_app_state};
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_cli_parses_serve_flags() {
        let cli = Cli::try_parse_from(["clipd", "serve", "--port", "9000", "--debug"]).unwrap();
        match cli.command {
            Some(Commands::Serve(args)) => {
                assert_eq!(args.port, Some(9000));
                assert!(args.debug);
                assert!(args.host.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_global_data_dir() {
        let cli = Cli::try_parse_from(["clipd", "config", "--data-dir", "/tmp/x"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Config)));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[tokio::test]
    async fn test_router_wires_api_routes() {
        let (state, _tmp) = test_app_state().await;
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/uploads")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"file_name":"a.bin","total_chunks":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = read_json(resp).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/uploads/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["status"], "uploading");
    }

    #[tokio::test]
    async fn test_status_changes_reach_realtime_subscribers() {
        use realtime_mux::{EventFilter, SubscribeStatus, SubscriptionKey, handler};

        let (state, _tmp) = test_app_state().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = state.multiplexer.subscribe(
            "uploads",
            SubscriptionKey::new("public", "upload_sessions")
                .event(EventFilter::Update)
                .filter("status=eq.completed"),
            handler(move |e| {
                let _ = tx.send(e.new.clone());
            }),
            None,
        );
        for _ in 0..50 {
            if state.multiplexer.active_subscriptions()["channel:uploads"].status
                == Some(SubscribeStatus::Subscribed)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let app = build_router(state.clone());
        let session = state.sessions.create("b.bin".into(), 1).await.unwrap();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/uploads/{}/chunks/0", session.session_id))
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/uploads/{}/complete", session.session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let row = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["session_id"], session.session_id.as_str());
        assert_eq!(row["file_size"], 5);
        sub.unsubscribe();
    }
}
