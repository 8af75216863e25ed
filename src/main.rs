//! # Stentor - Single-Room Audio Intercom
//!
//! Browsers connect over WebSocket and talk to one loudspeaker attached to
//! this machine. Two modes are available:
//!
//! - **live**: one client at a time holds the channel and its audio is piped
//!   straight into the player, with a hard time limit
//! - **queue**: clients send complete recordings which are announced with a
//!   chime and played one after another
//!
//! ## Application Architecture:
//! - **config**: configuration from defaults, `config.toml` and the environment
//! - **state**: shared handles passed to every handler
//! - **intercom**: connection registry, live arbitration and the delivery queue
//! - **audio**: player process, chime synthesis, loudness normalization, scratch files
//! - **websocket**: one actor per connected client
//! - **handlers** / **health**: small HTTP endpoints for the web client and monitoring

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod intercom;
mod state;
mod websocket;

use actix::{Actor, Addr};
use actix_cors::Cors;
use actix_files::Files;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::loudnorm::Loudnorm;
use audio::sink::PlaybackSink;
use audio::{chime, store::AudioStore};
use crate::config::{AppConfig, IntercomMode};
use intercom::broadcast::{Broadcaster, EndBroadcast};
use intercom::queue::{DeliveryQueue, QueueService, QueueWorker};
use intercom::registry::ConnectionRegistry;
use state::{AppState, Intercom};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting stentor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        mode = %config.intercom.mode,
        dry_run = config.playback.dry_run,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );
    if config.playback.dry_run {
        warn!("Dry run enabled: nothing will be played");
    }

    let config = Arc::new(config);
    let registry = Arc::new(ConnectionRegistry::new());
    let (intercom, worker) = start_intercom(&config, registry.clone())?;

    let app_state = web::Data::new(AppState::new(config.clone(), registry, intercom.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let static_dir = config.server.static_dir.clone();
    let serve_static = static_dir.is_dir();
    if !serve_static {
        warn!(path = %static_dir.display(), "Static directory not found, web client will not be served");
    }

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let app = App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/config", web::get().to(handlers::get_config))
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::intercom_websocket));

        // mounted last so it never shadows the routes above
        if serve_static {
            app.service(Files::new("/", static_dir.clone()).index_file("index.html"))
        } else {
            app
        }
    })
    .disable_signals()
    .bind(&bind_addr)?
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

    stop_intercom(&intercom, worker).await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Build the machinery for the configured mode.
///
/// Queue mode also gets its scratch directory, the chime file and the
/// background worker; the returned handle lets shutdown stop that worker.
fn start_intercom(
    config: &AppConfig,
    registry: Arc<ConnectionRegistry>,
) -> Result<(Intercom, Option<JoinHandle<()>>)> {
    let sink = PlaybackSink::new(config.playback.clone());

    match config.intercom.mode {
        IntercomMode::Live => {
            let broadcaster: Addr<Broadcaster> =
                Broadcaster::new(registry, sink, config.intercom.broadcast_timeout()).start();
            Ok((Intercom::Live(broadcaster), None))
        }
        IntercomMode::Queue => {
            let store = Arc::new(AudioStore::create()?);
            let chime_path = store.chime_path();
            chime::write_chime(&chime_path)?;
            info!(path = %chime_path.display(), "Chime ready");

            let queue = Arc::new(DeliveryQueue::new(config.intercom.queue_capacity));
            let mut worker = QueueWorker::new(queue.clone(), Arc::new(sink), config.intercom.queue_gap())
                .with_chime(chime_path);

            if config.playback.normalize_volume && !config.playback.dry_run {
                worker = worker.with_normalizer(Arc::new(Loudnorm::new(config.playback.ffmpeg.clone())));
            }

            info!(
                capacity = config.intercom.queue_capacity,
                max_recording_secs = config.intercom.max_recording_seconds,
                "Message queue ready"
            );
            Ok((Intercom::Queue(QueueService::new(queue, store)), Some(worker.spawn())))
        }
    }
}

/// Release the speaker: end any live broadcast and stop the queue worker.
/// The scratch directory goes away when the last handle to it is dropped.
async fn stop_intercom(intercom: &Intercom, worker: Option<JoinHandle<()>>) {
    if let Intercom::Live(broadcaster) = intercom {
        if let Err(err) = broadcaster.send(EndBroadcast).await {
            warn!(error = %err, "Broadcaster already stopped");
        }
    }

    if let Some(worker) = worker {
        worker.abort();
        let _ = worker.await;
    }
}

/// Initialize tracing.
///
/// `RUST_LOG` controls verbosity; without it the default is
/// `stentor=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stentor=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        },
        _ = terminate => info!("Received SIGTERM"),
    }
}
