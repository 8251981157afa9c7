//! StageLink realtime gateway binary
//!
//! Binds one network port and multiplexes room traffic over it: a small room
//! HTTP API plus the `/ws` endpoint clients subscribe through.

use anyhow::Result;
use clap::Parser;
use stagelink_common::config::{load_config, ConfigOverrides};
use stagelink_common::db::{init_database, Store};
use stagelink_gw::{build_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stagelink-gw", about = "StageLink realtime gateway")]
struct Args {
    /// Bind address, host:port
    #[arg(long, env = "STAGELINK_BIND")]
    bind: Option<String>,

    /// SQLite database path
    #[arg(long, env = "STAGELINK_DB")]
    database: Option<PathBuf>,

    /// Create a placeholder room when a client joins an unknown room key
    #[arg(long, env = "STAGELINK_AUTO_CREATE_ROOMS")]
    auto_create_rooms: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber first, before anything can log
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!(
        "Starting StageLink Gateway (stagelink-gw) v{}",
        env!("CARGO_PKG_VERSION")
    );

    let args = Args::parse();
    let overrides = ConfigOverrides {
        bind: args.bind,
        database: args.database,
        auto_create_rooms: args.auto_create_rooms,
    };
    let config = load_config(&overrides)?;
    info!("Database path: {}", config.database_path.display());
    info!(
        "Join policy: {}",
        if config.auto_create_rooms {
            "auto-create unknown rooms"
        } else {
            "reject unknown rooms"
        }
    );

    let pool = init_database(&config.database_path).await?;
    let store = Store::new(pool);

    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState::new(store, config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("stagelink-gw listening on http://{}", bind_addr);
    info!("WebSocket endpoint: ws://{}/ws?room=<key>", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
