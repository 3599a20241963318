//! # Babelcast Backend - Server Entry Point
//!
//! Boots the Actix-web server hosting the broadcast WebSocket endpoint and
//! the speaker's REST control surface.
//!
//! ## Startup Sequence:
//! 1. Load environment + configuration and validate it
//! 2. Initialize structured logging
//! 3. Build the shared component graph (AppState)
//! 4. Spawn the lifecycle-event metrics consumer
//! 5. Serve until SIGTERM/SIGINT, then stop gracefully

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use babelcast_backend::{handlers, health, middleware, websocket, AppConfig, AppState};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting babelcast-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (connection ttl {}s, refresh margin {}s)",
        config.server.host,
        config.server.port,
        config.lifecycle.connection_ttl_secs,
        config.lifecycle.refresh_margin_secs
    );

    let (app_state, mut lifecycle_events) = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Every lifecycle transition in the process flows through this one
    // consumer into the metrics counters
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            while let Some(event) = lifecycle_events.recv().await {
                state.record_lifecycle_event(&event);
            }
        });
    }

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions", web::post().to(handlers::create_session))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}/pause", web::post().to(handlers::pause_session))
                    .route("/sessions/{id}/resume", web::post().to(handlers::resume_session))
                    .route("/sessions/{id}/mute", web::post().to(handlers::mute_session))
                    .route("/sessions/{id}/unmute", web::post().to(handlers::unmute_session))
                    .route("/sessions/{id}/end", web::post().to(handlers::end_session)),
            )
            .route("/ws", web::get().to(websocket::broadcast_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "babelcast_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("Failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}
