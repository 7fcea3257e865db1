//! Lifecycle controller.
//!
//! Owns one worker per active route and turns route events and health reports
//! into register/unregister calls:
//!
//! ```text
//! RouteEvent ──▶ ┌────────────┐ ──spawn/cancel──▶ workers
//!                │ controller │
//! StatusReport ─▶└────────────┘ ──dispatch──▶ message bus | lease registrar
//! ```
//!
//! Events are drained before reports, and reports from a worker that is no
//! longer current are dropped, so a removed route is never registered again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, REGISTER_SUBJECT, UNREGISTER_SUBJECT};
use crate::error::DispatchError;
use crate::health::{HealthChecker, HealthOutcome};
use crate::lease::LeaseRegistrar;
use crate::reconciler::RouteEvent;
use crate::route::Route;
use crate::worker::{spawn_worker, StatusReport, WorkerHandle};

/// Capacity of the worker report queue.
pub const REPORT_QUEUE_CAPACITY: usize = 1024;

/// Default bound on a single register/unregister call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time workers get to exit on shutdown before being aborted.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identifies this registrar instance to the routing fabric.
    pub instance_id: String,
    /// Bound on a single dispatch.
    pub call_timeout: Duration,
    /// Time workers get to exit on shutdown.
    pub shutdown_grace: Duration,
}

impl ControllerConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// What to do with a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    Unregister,
}

impl Action {
    /// Message bus subject for this action.
    pub fn subject(self) -> &'static str {
        match self {
            Self::Register => REGISTER_SUBJECT,
            Self::Unregister => UNREGISTER_SUBJECT,
        }
    }
}

/// Result of the final unregistration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Routes an unregistration was attempted for.
    pub attempted: usize,
    /// Attempts that failed.
    pub failed: usize,
    /// Workers that had to be aborted after the grace period.
    pub aborted_workers: usize,
}

impl ShutdownSummary {
    /// Returns true if every route was unregistered.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Drives route workers and dispatches registration decisions.
pub struct LifecycleController {
    checker: Arc<dyn HealthChecker>,
    bus: Arc<dyn MessageBus>,
    leases: Option<Arc<LeaseRegistrar>>,
    config: ControllerConfig,
    workers: HashMap<Route, WorkerHandle>,
    next_worker_id: u64,
    reports_tx: mpsc::Sender<StatusReport>,
    reports_rx: mpsc::Receiver<StatusReport>,
}

impl LifecycleController {
    /// Create a new controller.
    ///
    /// `leases` is required only if leased routes are expected.
    pub fn new(
        checker: Arc<dyn HealthChecker>,
        bus: Arc<dyn MessageBus>,
        leases: Option<Arc<LeaseRegistrar>>,
        config: ControllerConfig,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_QUEUE_CAPACITY);
        Self {
            checker,
            bus,
            leases,
            config,
            workers: HashMap::new(),
            next_worker_id: 0,
            reports_tx,
            reports_rx,
        }
    }

    /// Number of active workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Process events and reports until shutdown or until the event stream
    /// ends, then unregister every known route.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RouteEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ShutdownSummary {
        info!(instance_id = %self.config.instance_id, "Starting lifecycle controller");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lifecycle controller received shutdown signal");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Route event stream ended");
                        break;
                    }
                },
                Some(report) = self.reports_rx.recv() => {
                    self.handle_report(report).await;
                }
            }
        }

        self.shutdown().await
    }

    /// Apply one route event.
    pub async fn handle_event(&mut self, event: RouteEvent) {
        match event {
            RouteEvent::Discovered(route) => self.start_worker(route),
            RouteEvent::Removed(route) => {
                match self.workers.remove(&route) {
                    Some(handle) => {
                        handle.cancel();
                        info!(route = %route.name, worker_id = handle.id, "Route removed, worker cancelled");
                    }
                    None => {
                        debug!(route = %route.name, "Removed route had no worker");
                    }
                }
                self.apply(Action::Unregister, &route).await;
            }
        }
    }

    /// Act on one health report.
    pub async fn handle_report(&mut self, report: StatusReport) {
        let current = self
            .workers
            .get(&report.route)
            .is_some_and(|handle| handle.id == report.worker_id);
        if !current {
            debug!(
                route = %report.route.name,
                worker_id = report.worker_id,
                tick = report.tick,
                "Dropping report from retired worker"
            );
            return;
        }

        let route = &report.route;
        match &report.outcome {
            HealthOutcome::Unhealthy => {
                warn!(route = %route.name, tick = report.tick, "Route unhealthy, unregistering");
            }
            HealthOutcome::Failed(reason) => {
                error!(route = %route.name, tick = report.tick, error = %reason, "Health check failed to run, unregistering");
            }
            HealthOutcome::NotConfigured | HealthOutcome::Healthy => {}
        }

        let action = if report.outcome.should_register() {
            Action::Register
        } else {
            Action::Unregister
        };

        self.apply(action, route).await;
    }

    /// Cancel every worker and unregister every known route.
    pub async fn shutdown(&mut self) -> ShutdownSummary {
        let mut workers: Vec<(Route, WorkerHandle)> = self.workers.drain().collect();
        workers.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));

        info!(routes = workers.len(), "Shutting down, unregistering all routes");

        for (_, handle) in &workers {
            handle.cancel();
        }

        let mut summary = ShutdownSummary::default();
        for (route, _) in &workers {
            summary.attempted += 1;
            if let Err(e) = self.dispatch(Action::Unregister, route).await {
                summary.failed += 1;
                error!(route = %route.name, error = %e, "Failed to unregister route on shutdown");
            }
        }

        for (route, handle) in workers {
            if !handle.stop(self.config.shutdown_grace).await {
                warn!(route = %route.name, "Force aborting route worker");
                summary.aborted_workers += 1;
            }
        }

        info!(
            attempted = summary.attempted,
            failed = summary.failed,
            aborted_workers = summary.aborted_workers,
            "Lifecycle controller shutdown complete"
        );
        summary
    }

    fn start_worker(&mut self, route: Route) {
        if self.workers.contains_key(&route) {
            debug!(route = %route.name, "Worker already running for route");
            return;
        }

        self.next_worker_id += 1;
        let id = self.next_worker_id;
        info!(
            route = %route.name,
            fingerprint = %route.fingerprint(),
            worker_id = id,
            leased = route.is_leased(),
            "Route discovered, starting worker"
        );

        let handle = spawn_worker(
            id,
            route.clone(),
            Arc::clone(&self.checker),
            self.reports_tx.clone(),
        );
        self.workers.insert(route, handle);
    }

    /// Dispatch and log; failures are retried by the next report.
    async fn apply(&self, action: Action, route: &Route) {
        match self.dispatch(action, route).await {
            Ok(()) => debug!(route = %route.name, action = ?action, "Route dispatched"),
            Err(e) => error!(route = %route.name, action = ?action, error = %e, "Route dispatch failed"),
        }
    }

    /// Send one register/unregister to the right collaborator.
    ///
    /// Leased routes get at least the registrar's own budget, so the outer
    /// bound never cuts off a mapping call that is still within its timeout.
    pub async fn dispatch(&self, action: Action, route: &Route) -> Result<(), DispatchError> {
        if !route.is_leased() {
            let publish = self.bus.send_message(
                action.subject(),
                route,
                &route.host,
                &self.config.instance_id,
            );
            return bounded(self.config.call_timeout, publish).await?.map_err(Into::into);
        }

        let leases = self
            .leases
            .as_ref()
            .ok_or_else(|| DispatchError::LeaseUnavailable {
                route: route.name.clone(),
            })?;
        let budget = self.config.call_timeout.max(leases.call_budget());
        let lease = async {
            match action {
                Action::Register => leases.register(route).await,
                Action::Unregister => leases.unregister(route).await,
            }
        };
        bounded(budget, lease).await?.map_err(Into::into)
    }
}

async fn bounded<T>(after: Duration, call: impl Future<Output = T>) -> Result<T, DispatchError> {
    tokio::time::timeout(after, call)
        .await
        .map_err(|_| DispatchError::Timeout { after })
}
