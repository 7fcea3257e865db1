//! Per-route health worker.
//!
//! One worker runs per active route. Once started it waits one full
//! registration interval, evaluates the route's health, emits exactly one
//! [`StatusReport`] and repeats until cancelled:
//!
//! ```text
//! Idle ──start──▶ Ticking ──cancel──▶ Stopped
//!   └───────────cancel───────────────▲
//! ```
//!
//! Cancellation is observed at every await point. An in-flight evaluation is
//! dropped, which kills the health-check process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health::{self, HealthChecker, HealthOutcome};
use crate::route::Route;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, task not yet running.
    Idle,
    /// Running; evaluates on every interval.
    Ticking,
    /// Cancelled; emits nothing more.
    Stopped,
}

/// One health observation for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Generation of the worker that produced this report.
    pub worker_id: u64,
    pub route: Route,
    /// 1-based tick counter within the worker.
    pub tick: u64,
    pub outcome: HealthOutcome,
}

/// Owning handle to a running worker.
pub struct WorkerHandle {
    /// Generation id, unique per controller.
    pub id: u64,
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// Cancel and wait up to `grace` for the task to exit, aborting it after.
    ///
    /// Returns false if the task had to be aborted.
    pub async fn stop(self, grace: Duration) -> bool {
        self.cancel();
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                false
            }
        }
    }
}

/// Spawn a worker for `route` that sends reports on `reports`.
pub fn spawn_worker(
    id: u64,
    route: Route,
    checker: Arc<dyn HealthChecker>,
    reports: mpsc::Sender<StatusReport>,
) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(WorkerState::Idle);

    let task = tokio::spawn(run_worker(id, route, checker, reports, cancel_rx, state_tx));

    WorkerHandle {
        id,
        cancel_tx,
        state_rx,
        task,
    }
}

async fn run_worker(
    id: u64,
    route: Route,
    checker: Arc<dyn HealthChecker>,
    reports: mpsc::Sender<StatusReport>,
    mut cancel: watch::Receiver<bool>,
    state: watch::Sender<WorkerState>,
) {
    let interval = route.registration_interval;
    info!(
        route = %route.name,
        worker_id = id,
        interval_ms = interval.as_millis() as u64,
        "Starting route worker"
    );

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0u64;
    state.send_replace(WorkerState::Ticking);

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = ticker.tick() => {}
        }

        tick += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            outcome = health::evaluate(checker.as_ref(), route.health_check.as_ref()) => outcome,
        };

        debug!(route = %route.name, worker_id = id, tick, outcome = outcome.label(), "Route evaluated");

        let report = StatusReport {
            worker_id: id,
            route: route.clone(),
            tick,
            outcome,
        };

        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            sent = reports.send(report) => {
                if sent.is_err() {
                    warn!(route = %route.name, worker_id = id, "Report channel closed");
                    break;
                }
            }
        }
    }

    state.send_replace(WorkerState::Stopped);
    debug!(route = %route.name, worker_id = id, ticks = tick, "Route worker stopped");
}

/// Resolves once cancellation is requested or the handle is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::health::{MockHealthChecker, MockResult};
    use crate::route::HealthCheck;

    fn route(name: &str, script: Option<&str>) -> Route {
        Route {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: Some(8080),
            tls_port: None,
            external_port: None,
            router_group: None,
            uris: vec![format!("{name}.example.com")],
            tags: BTreeMap::new(),
            route_service_url: None,
            registration_interval: Duration::from_secs(10),
            health_check: script.map(|s| HealthCheck {
                name: format!("{name}-health-check"),
                script_path: PathBuf::from(s),
                timeout: Duration::from_secs(5),
            }),
            options: None,
            server_cert_domain_san: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_report_after_one_interval() {
        let checker = Arc::new(MockHealthChecker::new());
        let (tx, mut rx) = mpsc::channel(16);
        let start = Instant::now();

        let handle = spawn_worker(7, route("web", None), checker.clone(), tx);

        let report = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
        assert_eq!(report.worker_id, 7);
        assert_eq!(report.tick, 1);
        assert_eq!(report.outcome, HealthOutcome::NotConfigured);
        assert_eq!(handle.state(), WorkerState::Ticking);
        assert_eq!(checker.call_count(), 0);

        let report = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(21));
        assert_eq!(report.tick, 2);

        assert!(handle.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_report_per_tick_with_check() {
        let checker = Arc::new(MockHealthChecker::new());
        checker.set("/check.sh", MockResult::Unhealthy);
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn_worker(1, route("api", Some("/check.sh")), checker.clone(), tx);

        for expected in 1..=3 {
            let report = rx.recv().await.unwrap();
            assert_eq!(report.tick, expected);
            assert_eq!(report.outcome, HealthOutcome::Unhealthy);
        }
        assert_eq!(checker.call_count(), 3);

        handle.cancel();
        while rx.recv().await.is_some() {}
        assert_eq!(checker.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticking_as_soon_as_started() {
        let checker = Arc::new(MockHealthChecker::new());
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn_worker(3, route("web", None), checker, tx);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(handle.state(), WorkerState::Ticking);
        assert!(rx.try_recv().is_err());
        assert!(handle.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_tick_emits_nothing() {
        let checker = Arc::new(MockHealthChecker::new());
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn_worker(1, route("web", None), checker, tx);
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.cancel();

        assert!(rx.recv().await.is_none());
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(handle.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_evaluation() {
        let checker = Arc::new(MockHealthChecker::new());
        checker.set("/slow.sh", MockResult::Hang);
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn_worker(1, route("slow", Some("/slow.sh")), checker.clone(), tx);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(checker.call_count(), 1);
        assert_eq!(handle.state(), WorkerState::Ticking);

        assert!(handle.stop(Duration::from_secs(1)).await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exits_when_receiver_dropped() {
        let checker = Arc::new(MockHealthChecker::new());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let handle = spawn_worker(1, route("web", None), checker, tx);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(handle.state(), WorkerState::Stopped);
    }
}
