//! mailidx - IMAP daemon entry point

use anyhow::Result;
use mailidx_common::config::{Config, LoggingConfig};
use mailidx_core::{BackendRegistry, ImapServer, MailStore, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&PathBuf::from(path))?,
        None => Config::load()?,
    };

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting mailidx IMAP server...");

    // Select and open the search backend
    let backend = BackendRegistry::global().create(&config.index)?;
    info!(
        engine = backend.name(),
        data_dir = %config.index.data_dir.display(),
        "Search backend selected"
    );

    let store = Arc::new(MailStore::open(&config.index, backend).await?);
    let manager = Arc::new(SessionManager::new(
        config.imap.max_clients,
        Arc::clone(&store),
    ));

    let imap_server = ImapServer::new(&config, Arc::clone(&store), Arc::clone(&manager));
    let listener = imap_server.bind().await?;

    let token = CancellationToken::new();
    let imap_handle = {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = imap_server.run(listener, token).await {
                error!("IMAP server error: {}", e);
            }
        })
    };

    info!("mailidx server started successfully");

    // Wait for shutdown signal
    wait_for_signal().await?;
    info!("Shutdown signal received");

    token.cancel();
    if let Err(e) = imap_handle.await {
        error!("IMAP accept loop failed: {}", e);
    }

    manager.shutdown().await;
    store.close_index().await?;

    info!("terminated");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailidx=debug", logging.level)));

    let json = logging.format.eq_ignore_ascii_case("json");
    let json_layer = json.then(|| fmt::layer().json().with_target(true).with_level(true));
    let text_layer = (!json).then(|| fmt::layer().with_target(true).with_level(true));

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();
}
