//! ==============================================================================
//! main.rs - garden live daemon entry point
//! ==============================================================================
//!
//! purpose:
//!     runs one LiveView against the garden backend and serves it locally,
//!     so a dashboard (or curl) always sees the reconciled state of the
//!     selected garden.
//!
//! responsibilities:
//!     - load garden.toml and set up logging
//!     - build the http backend client and the file-backed cache
//!     - pick the initial garden (persisted > hint > first)
//!     - serve the live-view api; push events arrive on /hooks/live
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                     garden-live (this file)                  │
//!     │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//!     │  │ http backend │   │  room hub    │   │  file cache      │  │
//!     │  │ (reqwest)    │   │ (/hooks/live)│   │ (.garden-cache)  │  │
//!     │  └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘  │
//!     │         └──────────────────┼────────────────────┘            │
//!     │                      ┌─────┴─────┐                           │
//!     │                      │ LiveView  │ <- view.rs                │
//!     │                      └─────┬─────┘                           │
//!     │                            │                                 │
//!     │                    ┌───────┴───────┐                         │
//!     │                    │ api (port 3000)│ <- server.rs           │
//!     │                    └───────────────┘                         │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use garden_live::backend::HttpBackend;
use garden_live::cache::{DurableCache, FileStore};
use garden_live::config::DashboardConfig;
use garden_live::live::RoomHub;
use garden_live::{server, LiveView};

#[tokio::main]
async fn main() -> Result<()> {
    println!("===========================================================");
    println!("  Garden Live - sensor & device state daemon");
    println!("===========================================================");

    // step 1: load configuration
    let config = DashboardConfig::load_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    config.print_summary();

    // step 2: collaborators
    let api = Arc::new(HttpBackend::new(&config.backend)?);
    let cache = DurableCache::new(Arc::new(FileStore::open(&config.cache.dir)?));
    let hub = RoomHub::new();

    // step 3: the view and its first garden
    let view = LiveView::new(api, Arc::new(hub.clone()), cache, config.timing);
    match view.start(config.garden.hint.as_deref()).await {
        Ok(Some(garden)) => tracing::info!(%garden, "watching garden"),
        Ok(None) => tracing::warn!("no gardens available yet"),
        // the api stays up so a later /api/select can recover
        Err(e) => tracing::error!("failed to load gardens: {}", e),
    }

    // step 4: serve until ctrl-c
    tracing::info!(bind = %config.server.bind, "live view api starting");
    server::run_server(&config.server.bind, view, hub).await
}
