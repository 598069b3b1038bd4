//! TurfTrack backend server: GDD accumulation and recalculation behind an
//! HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;

use turftrack_backend::api::create_router;
use turftrack_backend::gdd::GddEngine;
use turftrack_backend::store::GddStore;
use turftrack_backend::tasks::TaskMonitor;

#[derive(Parser, Debug)]
#[command(name = "turftrack", about = "Growing degree day tracking service")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "TURFTRACK_DB_PATH", default_value = "turftrack.db")]
    db_path: String,

    /// Port to listen on
    #[arg(long, env = "TURFTRACK_PORT", default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let args = Args::parse();

    info!("🌱 TurfTrack GDD engine starting");

    let store = Arc::new(GddStore::open(&args.db_path)?);
    let tasks = Arc::new(TaskMonitor::new(store.clone()));
    let engine = Arc::new(GddEngine::new(store, tasks));

    let app = create_router(engine)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turftrack_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
