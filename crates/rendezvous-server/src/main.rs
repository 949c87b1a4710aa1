use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rendezvous_server::api::{self, AppState};
use rendezvous_server::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rendezvous_server=debug")),
        )
        .init();

    info!("Starting rendezvous server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        registration_open = config.registration_open,
        admin_enabled = config.admin_token.is_some(),
        advertise_addr = ?config.advertise_addr,
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Start registry, broadcaster and rendezvous listener
    // -----------------------------------------------------------------------
    let server = rendezvous_server::start(&config).await?;

    let app_state = AppState {
        registry: server.registry.clone(),
        config: Arc::new(config.clone()),
        broadcast_trigger: server.broadcast_trigger.clone(),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    server.shutdown();
    Ok(())
}
