use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use buildbroker::config::ServerConfig;
use buildbroker::jobqueue::FsJobQueue;
use buildbroker::server::Server;

#[derive(Parser, Debug)]
#[command(name = "buildbroker")]
#[command(about = "Worker-job server brokering image builds to remote workers")]
struct Args {
    /// Address to serve the worker API on
    #[arg(long, default_value = "0.0.0.0:8700")]
    listen: String,

    /// URL prefix for all routes
    #[arg(long, default_value = "/api/worker/v1")]
    base_path: String,

    /// Directory holding the persistent job queue
    #[arg(long, default_value = "/var/lib/buildbroker/jobs")]
    queue_dir: PathBuf,

    /// Directory for uploaded artifacts (uploads are discarded when unset)
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// How long a job request may block, in milliseconds. 0 blocks until a
    /// job arrives.
    #[arg(long, default_value = "0")]
    request_timeout_ms: u64,

    /// Require an Authorization: Bearer header on every request
    #[arg(long)]
    require_auth: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen.parse()?;

    let mut config = ServerConfig::new(args.base_path)
        .with_request_timeout(Duration::from_millis(args.request_timeout_ms));
    if let Some(dir) = args.artifacts_dir {
        config = config.with_artifacts_dir(dir);
    }
    if args.require_auth {
        config = config.with_auth();
    }

    let queue = FsJobQueue::open(&args.queue_dir)?;
    let server = Server::new(queue, config);
    let app = server.router();

    tracing::info!(addr = %listen_addr, "Starting worker API server");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolve when SIGTERM or SIGINT arrives; blocked dequeues are dropped as
/// the server drains, leaving their jobs pending.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
    }
}
