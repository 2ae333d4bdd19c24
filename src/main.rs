//! docgate — main entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docgate::config::AppConfig;
use docgate::server::{create_app, warn_if_public_bind};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "docgate")]
#[command(about = "OpenAI-compatible tool-calling gateway with a local docs index")]
#[command(version)]
struct Args {
    /// Host to bind to (overrides DOCGATE_BIND_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides DOCGATE_BIND_PORT).
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Discard the cached docs index and rebuild it from a fresh crawl.
    #[arg(long)]
    rebuild_index: bool,

    /// Refetch all cached pages (keeps the crawl state).
    #[arg(long)]
    refresh_pages: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = AppConfig::load()?;
    if let Some(host) = args.host {
        config.server.bind_host = host;
    }
    if let Some(port) = args.port {
        config.server.bind_port = port;
    }
    tracing::info!("Configuration loaded");

    if (args.rebuild_index || args.refresh_pages) && !config.rag.enabled {
        anyhow::bail!("--rebuild-index/--refresh-pages need DOCGATE_RAG_ENABLED=true");
    }

    let addr = format!("{}:{}", config.server.bind_host, config.server.bind_port);
    warn_if_public_bind(&config.server.bind_host);

    let (app, state) = create_app(config, args.rebuild_index, args.refresh_pages).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Background tasks observe the cancellation flag between batches.
    state.signals.cancel();
    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Graceful shutdown on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
