#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use vidshelf::{
    api::{self, AppState},
    config::{DEFAULT_CONFIG_PATH, load_env_config_from},
    logging,
    security::ensure_not_root,
    storage::LocalBlobStore,
    store::Database,
    views::ViewRecorder,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the vidshelf HTTP API.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env config file")]
    config: PathBuf,
    #[arg(long = "upload-dir", value_name = "DIR", help = "Override UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,
    #[arg(long = "database", value_name = "PATH", help = "Override DATABASE_PATH")]
    database: Option<PathBuf>,
    #[arg(long = "host", help = "Override VIDSHELF_HOST")]
    host: Option<String>,
    #[arg(long = "port", help = "Override VIDSHELF_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    ensure_not_root("backend")?;

    let args = Args::parse();
    let mut env = load_env_config_from(&args.config)?;
    if args.upload_dir.is_some() {
        env.upload_dir = args.upload_dir;
    }
    if args.database.is_some() {
        env.database_path = args.database;
    }
    if args.host.is_some() {
        env.vidshelf_host = args.host;
    }
    if args.port.is_some() {
        env.vidshelf_port = args.port;
    }
    let config = env.resolve()?;

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let blobs = LocalBlobStore::new(&config.upload_dir)
        .with_context(|| format!("preparing upload dir {}", config.upload_dir.display()))?;
    let views = ViewRecorder::spawn(db.clone(), config.view_queue_capacity);

    let state = AppState {
        db,
        blobs: Arc::new(blobs),
        views,
        max_upload_bytes: config.max_upload_bytes,
    };
    let app = api::router(state);

    let addr = SocketAddr::new(
        config
            .vidshelf_host
            .parse()
            .with_context(|| format!("parsing VIDSHELF_HOST {}", config.vidshelf_host))?,
        config.vidshelf_port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, upload_dir = %config.upload_dir.display(), "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}
