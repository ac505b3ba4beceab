//! # Kiosk Voice Engine - Main Application Entry Point
//!
//! Starts the voice pipeline of a self-ordering kiosk:
//!
//! - **Local HTTP API** (actix-web): health, metrics, configuration and the
//!   session actions the kiosk screen triggers (start, payment, navigation)
//! - **UI task**: folds caption/cart/state events into shared state for the screen
//! - **Session loop**: one WebSocket session per customer with live microphone
//!   capture and speaker playback
//!
//! ## Shutdown:
//! SIGINT/SIGTERM close the running session with "Client closed", release the
//! audio devices and stop the HTTP server gracefully.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use kiosk_voice_engine::config::AppConfig;
use kiosk_voice_engine::session::ui::{ui_channel, UiReceiver};
use kiosk_voice_engine::session::run_kiosk;
use kiosk_voice_engine::state::AppState;
use kiosk_voice_engine::{handlers, health};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pending screen actions the session loop has not picked up yet.
const ACTION_QUEUE_CAPACITY: usize = 16;

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting kiosk-voice-engine v{}", env!("CARGO_PKG_VERSION"));
    info!(
        server = %config.transport.redacted_session_url(),
        capture_rate = config.audio.capture_target_rate,
        playback_rate = config.audio.playback_source_rate,
        auto_start = config.session.auto_start,
        "Configuration loaded"
    );

    let (actions_tx, actions_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
    let (ui_tx, ui_rx) = ui_channel();
    let app_state = AppState::new(config.clone(), actions_tx);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    setup_signal_handlers(shutdown_tx);

    tokio::spawn(forward_ui_events(app_state.clone(), ui_rx));

    info!("Starting local API on {}", bind_addr);

    let data = web::Data::new(app_state.clone());
    let server = HttpServer::new(move || {
        // The kiosk shell talks to the API from a local web view
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/payment", web::post().to(handlers::request_payment))
                    .route("/session/event", web::post().to(handlers::fire_event)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // The session loop owns the audio devices and stays on this task.
    tokio::select! {
        _ = run_kiosk(app_state, actions_rx, ui_tx, shutdown_rx) => {
            info!("Session loop finished, stopping local API...");
        }
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    server_handle.stop(true).await;
    info!("Kiosk stopped gracefully");
    Ok(())
}

/// Set up `tracing` with an `EnvFilter` (`RUST_LOG`) and console output.
///
/// Defaults to `kiosk_voice_engine=debug,actix_web=info` when `RUST_LOG` is unset.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiosk_voice_engine=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip the shutdown watch on SIGTERM or SIGINT.
fn setup_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Ctrl+C handler failed: {}", e);
                    return;
                }
                info!("Received Ctrl+C");
            }
        }

        if shutdown.send(true).is_err() {
            debug!("Session loop already stopped");
        }
    });
}

/// Keep the screen view in shared state up to date.
async fn forward_ui_events(state: AppState, mut events: UiReceiver) {
    while let Some(event) = events.recv().await {
        debug!(?event, "UI event");
        state.apply_ui_event(&event);
    }
}
