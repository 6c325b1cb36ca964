//! calibre-opds server entry point.

use calibre_opds::{
    catalog::Catalog,
    config::{Cli, Command, Config},
    server,
};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calibre_opds=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Check) => cmd_check(Config::resolve(&cli)?).await,
        Some(Command::Serve) | None => cmd_serve(Config::resolve(&cli)?).await,
    }
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());
    println!("\nPoint catalog.library_path at your Calibre library, then run: calibre-opds serve");

    Ok(())
}

/// Validate configuration and make sure the catalog answers queries.
async fn cmd_check(config: Config) -> anyhow::Result<()> {
    let catalog = Catalog::from_config(&config.catalog);
    catalog.ping().await?;

    println!(
        "Catalog OK: {} (page size {})",
        catalog.database_path().display(),
        config.feed.page_size
    );
    Ok(())
}

/// Start the server.
async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        bind = %config.server.bind,
        library = %config.catalog.library_path.display(),
        page_size = config.feed.page_size,
        "Starting calibre-opds server"
    );

    let state = server::AppState::new(config.clone());

    // A missing database is not fatal: the server starts unready and
    // /ready flips once the file appears. A writable connection is.
    match state.catalog.ping().await {
        Ok(()) => tracing::info!(
            database = %state.catalog.database_path().display(),
            "Catalog is readable"
        ),
        Err(e @ calibre_opds::AppError::Config(_)) => return Err(e.into()),
        Err(e) => tracing::warn!(error = %e, "Catalog not available yet"),
    }

    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
