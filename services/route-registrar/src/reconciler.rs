//! Route set reconciler.
//!
//! Periodically re-reads every route definition file matched by the configured
//! glob patterns and turns changes into [`RouteEvent`]s:
//!
//! 1. Enumerate matching files (a file matched by several patterns counts once)
//! 2. Read, parse and validate each one
//! 3. Diff its routes against what was last emitted for that file
//! 4. Emit discoveries, then removals
//!
//! A file that fails to read or parse keeps its previous routes for that pass.
//! A file that stops matching has all of its routes removed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rtreg_reconcile::{dedup_preserving_order, diff_sets};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::ReconcilerError;
use crate::route::{parse_route_file, Route};

/// A change in the desired route set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// Route newly present in a source.
    Discovered(Route),
    /// Route no longer present in a source.
    Removed(Route),
}

impl RouteEvent {
    /// The route this event is about.
    pub fn route(&self) -> &Route {
        match self {
            Self::Discovered(route) | Self::Removed(route) => route,
        }
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Sources matched this pass.
    pub sources: usize,
    /// Sources left untouched because they could not be read or parsed.
    pub skipped_sources: usize,
    /// Individual routes rejected by validation.
    pub skipped_routes: usize,
    pub discovered: usize,
    pub removed: usize,
}

impl PassSummary {
    /// Returns true if the pass emitted any event.
    pub fn has_changes(&self) -> bool {
        self.discovered + self.removed > 0
    }
}

/// Watches route definition files and emits route events.
pub struct RouteSetReconciler {
    patterns: Vec<String>,
    default_host: Option<String>,
    interval: Duration,
    events: mpsc::Sender<RouteEvent>,
    /// Routes last emitted per source.
    known: BTreeMap<PathBuf, Vec<Route>>,
}

impl RouteSetReconciler {
    /// Create a reconciler. Malformed patterns are rejected here.
    pub fn new(
        patterns: Vec<String>,
        default_host: Option<String>,
        interval: Duration,
        events: mpsc::Sender<RouteEvent>,
    ) -> Result<Self, ReconcilerError> {
        for pattern in &patterns {
            glob::Pattern::new(pattern).map_err(|source| ReconcilerError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        Ok(Self {
            patterns,
            default_host,
            interval,
            events,
            known: BTreeMap::new(),
        })
    }

    /// Number of routes currently tracked across all sources.
    pub fn known_routes(&self) -> usize {
        self.known.values().map(Vec::len).sum()
    }

    /// Run passes until shutdown. The first pass runs immediately.
    ///
    /// Returns an error only for failures that make further passes pointless.
    /// Shutdown emits no removals.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcilerError> {
        info!(
            patterns = ?self.patterns,
            interval_ms = self.interval.as_millis() as u64,
            "Starting route set reconciler"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(summary) if summary.has_changes() => {
                            info!(
                                sources = summary.sources,
                                discovered = summary.discovered,
                                removed = summary.removed,
                                "Route set changed"
                            );
                        }
                        Ok(summary) => {
                            debug!(sources = summary.sources, "Route set unchanged");
                        }
                        Err(ReconcilerError::EventsClosed) => {
                            info!("Route event receiver closed, stopping reconciler");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Route set reconciliation failed");
                            return Err(e);
                        }
                    }
                }
            }
        }

        info!(known_routes = self.known_routes(), "Route set reconciler shutting down");
        Ok(())
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile_once(&mut self) -> Result<PassSummary, ReconcilerError> {
        let patterns = self.patterns.clone();
        let present = tokio::task::spawn_blocking(move || enumerate_sources(&patterns)).await??;
        let mut summary = PassSummary {
            sources: present.len(),
            ..PassSummary::default()
        };

        let mut all: BTreeSet<PathBuf> = present.clone();
        all.extend(self.known.keys().cloned());

        for path in all {
            if present.contains(&path) {
                self.reconcile_source(&path, &mut summary).await?;
            } else if let Some(routes) = self.known.remove(&path) {
                info!(source = %path.display(), routes = routes.len(), "Route source disappeared");
                for route in routes {
                    self.emit(RouteEvent::Removed(route)).await?;
                    summary.removed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn reconcile_source(
        &mut self,
        path: &Path,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcilerError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(source = %path.display(), error = %e, "Failed to read route source, keeping previous routes");
                summary.skipped_sources += 1;
                return Ok(());
            }
        };

        let file = match parse_route_file(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!(source = %path.display(), error = %e, "Failed to parse route source, keeping previous routes");
                summary.skipped_sources += 1;
                return Ok(());
            }
        };

        let mut routes = Vec::with_capacity(file.routes.len());
        for definition in file.routes {
            match definition.resolve(self.default_host.as_deref()) {
                Ok(route) => routes.push(route),
                Err(e) => {
                    warn!(source = %path.display(), error = %e, "Skipping invalid route");
                    summary.skipped_routes += 1;
                }
            }
        }
        let routes = dedup_preserving_order(routes);

        let previous = self.known.get(path).map(Vec::as_slice).unwrap_or_default();
        let diff = diff_sets(previous, &routes);
        if !diff.is_empty() {
            debug!(
                source = %path.display(),
                added = diff.added.len(),
                removed = diff.removed.len(),
                "Route source changed"
            );
        }

        self.known.insert(path.to_path_buf(), routes);

        for route in diff.added {
            debug!(source = %path.display(), route = %route.name, fingerprint = %route.fingerprint(), "Route discovered");
            self.emit(RouteEvent::Discovered(route)).await?;
            summary.discovered += 1;
        }
        for route in diff.removed {
            debug!(source = %path.display(), route = %route.name, fingerprint = %route.fingerprint(), "Route removed");
            self.emit(RouteEvent::Removed(route)).await?;
            summary.removed += 1;
        }

        Ok(())
    }

    async fn emit(&self, event: RouteEvent) -> Result<(), ReconcilerError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ReconcilerError::EventsClosed)
    }
}

/// Files currently matched by any pattern, in sorted order.
///
/// Walks the file system; run it off the async runtime.
fn enumerate_sources(patterns: &[String]) -> Result<BTreeSet<PathBuf>, ReconcilerError> {
    let mut sources = BTreeSet::new();
    for pattern in patterns {
        let paths = glob::glob(pattern).map_err(|source| ReconcilerError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        for entry in paths {
            let path = entry.map_err(|source| ReconcilerError::Traverse {
                pattern: pattern.clone(),
                source,
            })?;
            if path.is_file() {
                sources.insert(path);
            }
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reconciler(dir: &TempDir) -> (RouteSetReconciler, mpsc::Receiver<RouteEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let pattern = format!("{}/*.yml", dir.path().display());
        let reconciler = RouteSetReconciler::new(
            vec![pattern],
            Some("10.0.0.1".to_string()),
            Duration::from_secs(1),
            tx,
        )
        .unwrap();
        (reconciler, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<RouteEvent>) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[RouteEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                RouteEvent::Discovered(r) => format!("+{}", r.name),
                RouteEvent::Removed(r) => format!("-{}", r.name),
            })
            .collect()
    }

    const WEB: &str = r#"
routes:
  - name: web
    port: 8080
    uris: [web.example.com]
    registration_interval: 10s
    tags:
      team: edge
      tier: frontend
"#;

    #[tokio::test]
    async fn test_unchanged_source_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("routes.yml"), WEB).unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);

        let first = reconciler.reconcile_once().await.unwrap();
        assert_eq!(first.discovered, 1);
        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["+web"]);
        assert_eq!(events[0].route().host, "10.0.0.1");

        let second = reconciler.reconcile_once().await.unwrap();
        assert!(!second.has_changes());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_tag_reorder_is_not_a_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("routes.yml");
        std::fs::write(&file, WEB).unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);
        reconciler.reconcile_once().await.unwrap();
        drain(&mut rx);

        std::fs::write(
            &file,
            r#"
routes:
  - name: web
    port: 8080
    uris: [web.example.com]
    registration_interval: 10s
    tags:
      tier: frontend
      team: edge
"#,
        )
        .unwrap();

        let summary = reconciler.reconcile_once().await.unwrap();
        assert!(!summary.has_changes());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_field_change_is_remove_plus_discover() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("routes.yml");
        std::fs::write(&file, WEB).unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);
        reconciler.reconcile_once().await.unwrap();
        drain(&mut rx);

        std::fs::write(&file, WEB.replace("8080", "9090")).unwrap();
        reconciler.reconcile_once().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["+web", "-web"]);
        assert_eq!(events[0].route().port, Some(9090));
        assert_eq!(events[1].route().port, Some(8080));
    }

    #[tokio::test]
    async fn test_deleted_source_removes_all_routes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("routes.yml");
        std::fs::write(
            &file,
            r#"
routes:
  - name: a
    port: 1
    uris: [a.example.com]
    registration_interval: 5s
  - name: b
    port: 2
    uris: [b.example.com]
    registration_interval: 5s
"#,
        )
        .unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);
        reconciler.reconcile_once().await.unwrap();
        drain(&mut rx);
        assert_eq!(reconciler.known_routes(), 2);

        std::fs::remove_file(&file).unwrap();
        let summary = reconciler.reconcile_once().await.unwrap();

        assert_eq!(summary.removed, 2);
        assert_eq!(names(&drain(&mut rx)), vec!["-a", "-b"]);
        assert_eq!(reconciler.known_routes(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_previous_routes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("routes.yml");
        std::fs::write(&file, WEB).unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);
        reconciler.reconcile_once().await.unwrap();
        drain(&mut rx);

        std::fs::write(&file, "routes: [ {{ not yaml").unwrap();
        let summary = reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary.skipped_sources, 1);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(reconciler.known_routes(), 1);

        // Restoring the same content is not a change either.
        std::fs::write(&file, WEB).unwrap();
        assert!(!reconciler.reconcile_once().await.unwrap().has_changes());
    }

    #[tokio::test]
    async fn test_invalid_routes_are_skipped_individually() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("routes.yml"),
            r#"
routes:
  - name: good
    port: 8080
    uris: [good.example.com]
    registration_interval: 10s
  - name: half-leased
    port: 8080
    router_group: default-tcp
    registration_interval: 10s
  - name: no-interval
    port: 8080
    uris: [x.example.com]
"#,
        )
        .unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);

        let summary = reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary.skipped_routes, 2);
        assert_eq!(names(&drain(&mut rx)), vec!["+good"]);
    }

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let dir = TempDir::new().unwrap();
        let body = WEB.replace("routes:\n", "");
        std::fs::write(
            dir.path().join("routes.yml"),
            format!("routes:\n{body}{body}"),
        )
        .unwrap();
        let (mut reconciler, mut rx) = reconciler(&dir);

        reconciler.reconcile_once().await.unwrap();
        assert_eq!(names(&drain(&mut rx)), vec!["+web"]);
        assert_eq!(reconciler.known_routes(), 1);
    }

    #[tokio::test]
    async fn test_sources_processed_in_path_order() {
        let dir = TempDir::new().unwrap();
        for name in ["b", "a", "c"] {
            std::fs::write(
                dir.path().join(format!("{name}.yml")),
                format!(
                    "routes:\n  - name: {name}\n    port: 80\n    uris: [{name}.example.com]\n    registration_interval: 1s\n"
                ),
            )
            .unwrap();
        }
        let (tx, mut rx) = mpsc::channel(64);
        // Overlapping patterns match each file once.
        let patterns = vec![
            format!("{}/*.yml", dir.path().display()),
            format!("{}/a.yml", dir.path().display()),
        ];
        let mut reconciler = RouteSetReconciler::new(patterns, None, Duration::from_secs(1), tx).unwrap();

        // No host anywhere: every route is skipped.
        let summary = reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary.sources, 3);
        assert_eq!(summary.skipped_routes, 3);
        assert!(drain(&mut rx).is_empty());

        reconciler.default_host = Some("192.168.0.2".to_string());
        reconciler.reconcile_once().await.unwrap();
        assert_eq!(names(&drain(&mut rx)), vec!["+a", "+b", "+c"]);
    }

    #[test]
    fn test_enumerate_skips_matching_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested.yml")).unwrap();
        std::fs::write(dir.path().join("web.yml"), "routes: []\n").unwrap();

        let sources = enumerate_sources(&[format!("{}/*.yml", dir.path().display())]).unwrap();
        assert_eq!(sources.into_iter().collect::<Vec<_>>(), vec![dir.path().join("web.yml")]);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let result = RouteSetReconciler::new(
            vec!["/etc/routes/[".to_string()],
            None,
            Duration::from_secs(1),
            tx,
        );
        assert!(matches!(result, Err(ReconcilerError::Pattern { .. })));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_without_removals() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("routes.yml"), WEB).unwrap();
        let (reconciler, mut rx) = reconciler(&dir);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(reconciler.run(shutdown_rx));
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RouteEvent::Discovered(_)));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }
}
