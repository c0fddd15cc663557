//! store-tunnel
//!
//! # Architecture Overview
//!
//! ```text
//!   SOCKS5 client                                              GOAL server
//!        │                                                          ▲
//!        ▼                                                          │
//!  ┌───────────┐   requests/I.req, I.chunk.N, I.ready   ┌─────────────────┐
//!  │  CALLER   │ ─────────────────────────────────────▶ │    LISTENER     │
//!  │ socks5 →  │                                        │ monitor →       │
//!  │ connector │            shared object store         │ processor →     │
//!  │ → rounds  │ ◀───────────────────────────────────── │ sessions / dial │
//!  └───────────┘   responses/I.resp or I.error          └─────────────────┘
//! ```
//!
//! `local` runs both roles in one process over an in-memory store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use store_tunnel::config::loader::load_config;
use store_tunnel::config::TunnelConfig;
use store_tunnel::lifecycle::signals::spawn_signal_handler;
use store_tunnel::observability::logging::init_logging;
use store_tunnel::observability::metrics::init_metrics;
use store_tunnel::storage::{build_store, MemoryStore, SharedStore};
use store_tunnel::{CallerService, ListenerService, Shutdown};

#[derive(Parser)]
#[command(name = "store-tunnel")]
#[command(about = "Tunnel TCP connections through a shared object store", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults and TUNNEL_* variables apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Clone, Copy)]
enum Role {
    /// Accept SOCKS5 clients and publish their traffic as request objects
    Caller,
    /// Serve request objects by dialing their targets
    Listener,
    /// Run both roles in-process over a memory store
    Local,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "store-tunnel starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    match cli.role {
        Role::Caller => {
            let store = build_store(&config.storage, &config.retries).await?;
            run_caller(&config, store, shutdown).await?;
        }
        Role::Listener => {
            let store = build_store(&config.storage, &config.retries).await?;
            run_listener(&config, store, shutdown).await;
        }
        Role::Local => {
            let store: SharedStore = Arc::new(MemoryStore::new());
            let listener = tokio::spawn({
                let config = config.clone();
                let store = store.clone();
                let shutdown = shutdown.clone();
                async move { run_listener(&config, store, shutdown).await }
            });
            run_caller(&config, store, shutdown).await?;
            listener.await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_caller(
    config: &TunnelConfig,
    store: SharedStore,
    shutdown: Shutdown,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = CallerService::bind(config, store).await?;
    tracing::info!(
        address = %service.local_addr()?,
        max_connections = config.caller.max_connections,
        "SOCKS5 front end listening"
    );
    service.run(shutdown).await;
    Ok(())
}

async fn run_listener(config: &TunnelConfig, store: SharedStore, shutdown: Shutdown) {
    tracing::info!(
        requests = %config.protocol.requests_folder,
        responses = %config.protocol.responses_folder,
        "LISTENER polling"
    );
    ListenerService::new(config, store).run(shutdown).await;
}
