// Receipty - Web Server
// REST API with Axum; receipt batches run on background tasks

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use receipty::api::{router, AppState};
use receipty::{db, logging, OpenAiExtractor, ProcessorOptions, ReceiptProcessor, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;
    logging::init_tracing(&settings.log_level);

    info!("🌐 Receipty - Web Server");

    // Open database
    let conn = db::open_database(&settings.database_path)?;
    info!(path = ?settings.database_path, "database opened");
    let db = Arc::new(Mutex::new(conn));

    // LLM extractor; the key is checked at startup rather than on the first batch
    let extractor = OpenAiExtractor::new(
        settings.require_openai_key()?.to_string(),
        Some(settings.openai_base_url.clone()),
        settings.openai_model.clone(),
        settings.llm_timeout_secs,
    );
    let processor = ReceiptProcessor::new(db.clone(), Arc::new(extractor), ProcessorOptions::from(&settings))?;

    if settings.guest_password.is_none() && settings.dev_password.is_none() {
        warn!("GUEST_PASSWORD and DEV_PASSWORD are unset; every authenticated route will answer 401");
    }

    // Create shared state
    let state = AppState {
        db,
        processor: Arc::new(processor),
        guest_password: settings.guest_password.clone(),
        dev_password: settings.dev_password.clone(),
    };

    let app = router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    info!(addr = %settings.bind_addr, model = %settings.openai_model, "🚀 server running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}
