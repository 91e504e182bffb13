use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sketchpad_workspace::{router, Config, DocumentService};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sketchpad-server")]
#[command(author, version, about = "Sketchpad document server", long_about = None)]
struct Args {
    /// Config file (default: ./sketchpad.config.json when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Backing file of the document store
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cwd = std::env::current_dir()?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(&cwd)?,
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(store) = args.store {
        config.store_path = store;
    }

    let repository = Arc::new(config.repository(&cwd));
    let service = DocumentService::new(repository.clone()).with_faults(config.fault_injector());
    let app = router(Arc::new(service));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(
        address = %addr,
        store = ?repository.path(),
        fault_every_nth_save = ?config.fault_injection.fail_every_nth_save,
        "Sketchpad server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
