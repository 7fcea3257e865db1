//! rtreg Route Registrar
//!
//! Watches route definition files and keeps each declared, healthy route
//! registered with the routing fabric.
//!
//! This service:
//! - Re-reads route definition files on a fixed interval
//! - Runs one health worker per route
//! - Publishes `router.register` / `router.unregister` on the message bus
//! - Leases TCP ports through the routing API for router-group routes
//! - Unregisters every route on shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rtreg_route_registrar::config::Config;
use rtreg_route_registrar::controller::{ControllerConfig, LifecycleController};
use rtreg_route_registrar::reconciler::RouteSetReconciler;
use rtreg_route_registrar::{
    HealthChecker, HttpRoutingApiClient, LeaseRegistrar, MessageBus, NatsMessageBus,
    OAuthTokenSource, RoutingApi, ScriptHealthChecker, TokenSource,
};

/// Capacity of the route event queue.
const EVENT_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RTREG_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rtreg route registrar");
    info!(
        instance_id = %config.instance_id,
        route_globs = ?config.route_globs,
        message_bus_servers = config.message_bus_servers.len(),
        routing_api = config.routing_api.is_some(),
        "Configuration loaded"
    );

    // Message bus
    let bus = Arc::new(NatsMessageBus::new(
        format!("route-registrar-{}", config.instance_id),
        config.request_timeout,
    ));
    if config.message_bus_servers.is_empty() {
        warn!("No message bus servers configured, pub-sub routes cannot be registered");
    } else {
        bus.connect(&config.message_bus_servers)
            .await
            .context("failed to connect to message bus")?;
    }

    // Lease registrar
    let leases = match &config.routing_api {
        Some(api) => {
            let tokens = OAuthTokenSource::new(
                &api.oauth_url,
                api.client_id.clone(),
                api.client_secret.clone(),
                config.request_timeout,
            )
            .context("failed to build oauth client")?;
            let client = HttpRoutingApiClient::new(&api.api_url, config.request_timeout)
                .context("failed to build routing api client")?;
            Some(Arc::new(LeaseRegistrar::new(
                Arc::new(tokens) as Arc<dyn TokenSource>,
                Arc::new(client) as Arc<dyn RoutingApi>,
                config.max_ttl,
                config.request_timeout,
            )))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let reconciler = RouteSetReconciler::new(
        config.route_globs.clone(),
        config.default_host.clone(),
        config.reconcile_interval,
        events_tx,
    )
    .context("invalid route pattern")?;

    let mut controller_config = ControllerConfig::new(config.instance_id.clone());
    controller_config.call_timeout = config.request_timeout;
    let controller = LifecycleController::new(
        Arc::new(ScriptHealthChecker::new()) as Arc<dyn HealthChecker>,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        leases,
        controller_config,
    );

    let mut reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));
    let controller_handle = tokio::spawn(controller.run(events_rx, shutdown_rx));

    // Wait for a shutdown signal or a fatal reconciler error
    let mut fatal = None;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            match result {
                Ok(Ok(())) => warn!("Route set reconciler exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Route set reconciler failed");
                    fatal = Some(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!(error = %e, "Route set reconciler task panicked");
                    fatal = Some(anyhow::Error::new(e));
                }
            }
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);

    if !reconciler_handle.is_finished() {
        if let Err(e) = reconciler_handle.await {
            error!(error = %e, "Route set reconciler task panicked");
        }
    }

    let summary = controller_handle
        .await
        .context("lifecycle controller task panicked")?;
    if !summary.is_clean() {
        warn!(
            attempted = summary.attempted,
            failed = summary.failed,
            "Some routes could not be unregistered"
        );
    }

    bus.close().await;
    info!("Route registrar shutdown complete");

    match fatal {
        Some(e) => Err(e.context("route set reconciler stopped")),
        None => Ok(()),
    }
}

/// Resolves on SIGINT, or on SIGTERM where supported.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
