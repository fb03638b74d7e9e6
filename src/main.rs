//! # voxera-live - Main Application Entry Point
//!
//! A real-time voice session service: it captures microphone audio, streams it
//! to a remote speech model over a bidirectional WebSocket session, and plays
//! the model's audio replies back gaplessly, with barge-in.
//!
//! ## Application Architecture:
//! - **config**: application configuration (config.toml + environment variables)
//! - **audio**: codec, analyser, output timeline, resampler and device backends
//! - **transport**: the remote session contract and its WebSocket client
//! - **live**: the session manager (state machine, capture, playback, levels)
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **handlers**: session control and config endpoints
//! - **websocket**: `/ws/live`, the UI contract over WebSocket
//! - **middleware**: request metrics
//! - **error**: error types and HTTP error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod live;
mod middleware;
mod state;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use error::AppError;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::GeminiLiveConnector;

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Starts the live session driver** with the configured audio backend
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**: the session is torn down before exit
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!("Starting voxera-live v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.live.api_key.as_deref().map_or(true, |key| key.trim().is_empty()) {
        warn!("No API key configured; connect attempts will fail until one is set");
    }

    let backend = audio::device::create_backend_from_string(&config.audio.backend, &config.audio)
        .context("failed to initialise audio backend")?;
    let connector = Arc::new(GeminiLiveConnector::new(
        config.live.endpoint.clone(),
        config.live.api_key.clone(),
    ));
    let live = live::spawn(config.live.clone(), config.audio.clone(), backend, connector);

    let app_state = AppState::new(config.clone(), live.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/connect", web::post().to(handlers::connect_session))
                    .route("/session/disconnect", web::post().to(handlers::disconnect_session))
                    .route("/session/mute", web::post().to(handlers::toggle_mute)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/live", web::get().to(websocket::live_websocket))
            .default_service(web::to(not_found))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Release the microphone, output device and remote session before exiting
    if let Err(e) = live.shutdown().await {
        warn!("Live session driver already stopped: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn not_found() -> Result<HttpResponse, AppError> {
    Err(AppError::NotFound("No such endpoint".to_string()))
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voxera_live=trace")
/// - If not set, defaults to "voxera_live=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxera_live=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
