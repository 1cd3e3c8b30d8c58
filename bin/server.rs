// Estimate Provenance - Web Server
// REST API with Axum over the SQLite-backed engine

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use estimate_provenance::{api, init_logging, EngineConfig, EstimatingEngine, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "estimate.json".to_string());
    let config = EngineConfig::load(&config_path)?;
    init_logging(&config.logging)?;

    println!("🌐 Estimate Provenance - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;
    println!("✓ Database opened: {:?}", config.database_path);

    let engine = EstimatingEngine::with_sqlite(Arc::new(store))
        .with_default_pricing(config.default_pricing.clone());
    config.seed_organizations(&engine)?;

    let app = api::router(Arc::new(engine));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;

    info!(bind = %config.server.bind, "server listening");
    println!("\n🚀 Server running on http://{}", config.server.bind);
    println!("   API: http://{}/api/health", config.server.bind);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
