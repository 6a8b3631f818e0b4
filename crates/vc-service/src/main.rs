//! Voice Controller
//!
//! Session and presence coordinator for audio-only voice channels.
//!
//! # Servers
//!
//! One HTTP server (default: 0.0.0.0:8425) carries:
//! - `/socket` WebSocket signaling
//! - `/health` and `/ready` checks
//! - `/metrics` Prometheus endpoint
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the media engine client and start the readiness check
//! 4. Create the backend validator and fetch ICE servers
//! 5. Initialize actor system (`ChannelControllerHandle`)
//! 6. Spawn the interop relay and the liveness monitor
//! 7. Serve until a shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vc_service::actors::{ActorMetrics, ChannelContext, ChannelControllerHandle};
use vc_service::backend::{run_interop_relay, HttpChannelValidator, InteropPublisher};
use vc_service::config::Config;
use vc_service::media::network::ListenerPlan;
use vc_service::media::remote::RemoteMediaEngine;
use vc_service::media::MediaEngine;
use vc_service::observability::{init_metrics_recorder, HealthState};
use vc_service::routes::build_routes;
use vc_service::signaling::SessionContext;
use vc_service::tasks::run_liveness_monitor;

/// Delay between readiness checks while the media engine is unreachable.
const ENGINE_READY_RETRY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before tracing so the log format can follow it
    let config = Config::from_env();
    let log_json = config.as_ref().is_ok_and(|c| c.log_json);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vc_service=info,tower_http=info".into());
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Voice Controller");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        vc_id = %config.vc_id,
        bind_address = %config.bind_address,
        backend_url = %config.backend_url,
        media_engine_url = %config.media_engine_url,
        interop_enabled = config.interop_ws_url.is_some(),
        disconnect_grace_secs = config.disconnect_grace.as_secs(),
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        heartbeat_miss_threshold_secs = config.heartbeat_miss_threshold.as_secs(),
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let engine: Arc<dyn MediaEngine> = Arc::new(
        RemoteMediaEngine::new(
            config.media_engine_url.clone(),
            config.media_engine_token.clone(),
        )
        .context("failed to create media engine client")?,
    );

    let validator = Arc::new(
        HttpChannelValidator::new(config.backend_url.clone())
            .context("failed to create backend validator")?,
    );
    let ice_servers = validator.fetch_ice_servers().await;
    info!(count = ice_servers.len(), "ICE servers loaded");

    let listeners = ListenerPlan::from_config(&config);
    for listener in listeners.listeners() {
        info!(
            family = %listener.family,
            announced = ?listener.announced_address,
            port = ?listener.port,
            "Media listener configured"
        );
    }

    let (interop, interop_events) = InteropPublisher::channel();
    let actor_metrics = ActorMetrics::new();

    let controller = ChannelControllerHandle::new(
        config.vc_id.clone(),
        ChannelContext {
            engine: Arc::clone(&engine),
            interop,
            metrics: Arc::clone(&actor_metrics),
            disconnect_grace: config.disconnect_grace,
        },
    );
    info!("Actor system initialized");

    let shutdown_token = controller.child_token();

    let readiness_handle = tokio::spawn(await_engine_readiness(
        Arc::clone(&engine),
        Arc::clone(&health_state),
        shutdown_token.clone(),
    ));

    let interop_handle = tokio::spawn(run_interop_relay(
        config.interop_ws_url.clone(),
        interop_events,
        controller.clone(),
        shutdown_token.clone(),
    ));

    let liveness_handle = tokio::spawn(run_liveness_monitor(
        controller.clone(),
        config.heartbeat_interval,
        config.heartbeat_miss_threshold,
        shutdown_token.clone(),
    ));

    let session_ctx = SessionContext {
        controller: controller.clone(),
        validator,
        engine,
        listeners: Arc::new(listeners),
        ice_servers: Arc::new(ice_servers),
        metrics: actor_metrics,
    };
    let app = build_routes(session_ctx, Arc::clone(&health_state), prometheus_handle);

    let bind_address: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, bind_address = %config.bind_address, "Invalid bind address");
        anyhow::anyhow!("invalid bind address {}: {e}", config.bind_address)
    })?;

    // Bind before spawning so a port conflict fails startup
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, bind_address = %bind_address, "Failed to bind HTTP server");
            e
        })?;
    info!(bind_address = %bind_address, "HTTP server listening");

    let server_token = shutdown_token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("Voice Controller running");

    shutdown_signal().await;
    info!("Shutdown signal received, draining");

    health_state.set_not_ready();
    shutdown_token.cancel();

    if let Err(e) = controller.shutdown().await {
        warn!(error = %e, "Controller shutdown reported an error");
    }

    for (name, handle) in [
        ("readiness", readiness_handle),
        ("interop", interop_handle),
        ("liveness", liveness_handle),
        ("server", server_handle),
    ] {
        match tokio::time::timeout(Duration::from_secs(10), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = name, error = %e, "Task panicked during shutdown"),
            Err(_) => warn!(task = name, "Task did not stop within timeout"),
        }
    }

    info!("Voice Controller stopped");
    Ok(())
}

/// Mark the service ready once the media engine answers.
async fn await_engine_readiness(
    engine: Arc<dyn MediaEngine>,
    health_state: Arc<HealthState>,
    cancel_token: CancellationToken,
) {
    loop {
        match engine.router_rtp_capabilities().await {
            Ok(_) => {
                health_state.set_ready();
                info!("Media engine reachable, service ready");
                return;
            }
            Err(e) => warn!(error = %e, "Media engine not reachable yet"),
        }

        tokio::select! {
            () = cancel_token.cancelled() => return,
            () = tokio::time::sleep(ENGINE_READY_RETRY) => {}
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
