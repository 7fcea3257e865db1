//! Health evaluation for routes.
//!
//! The [`HealthChecker`] trait abstracts running a route's health-check script
//! and reducing it to a boolean. [`evaluate`] folds the optional check and the
//! checker result into the tri-state [`HealthOutcome`] the controller acts on.
//!
//! Two implementations are provided:
//! - [`ScriptHealthChecker`]: runs the script as a child process
//! - [`MockHealthChecker`]: scripted results for tests and dry runs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::HealthCheckError;
use crate::route::HealthCheck;

/// Health-check executor.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Run the script at `script_path`, giving up after `timeout`.
    ///
    /// `Ok(false)` means the script ran and reported unhealthy; `Err` means
    /// health could not be determined.
    async fn check(&self, script_path: &Path, timeout: Duration) -> Result<bool, HealthCheckError>;
}

/// Result of one health evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Route has no health check; treated as always healthy.
    NotConfigured,
    /// Check ran and passed.
    Healthy,
    /// Check ran and failed.
    Unhealthy,
    /// Check could not be executed.
    Failed(String),
}

impl HealthOutcome {
    /// Whether the route should be registered after this outcome.
    pub fn should_register(&self) -> bool {
        matches!(self, Self::NotConfigured | Self::Healthy)
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotConfigured => "no_check",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Failed(_) => "error",
        }
    }
}

/// Evaluate an optional health check.
pub async fn evaluate(checker: &dyn HealthChecker, check: Option<&HealthCheck>) -> HealthOutcome {
    let Some(check) = check else {
        return HealthOutcome::NotConfigured;
    };

    match checker.check(&check.script_path, check.timeout).await {
        Ok(true) => HealthOutcome::Healthy,
        Ok(false) => HealthOutcome::Unhealthy,
        Err(e) => HealthOutcome::Failed(e.to_string()),
    }
}

// =============================================================================
// Script checker
// =============================================================================

/// Runs health-check scripts as child processes.
///
/// Exit status 0 is healthy, any other exit status is unhealthy. The child is
/// killed when the timeout elapses or when the evaluation is dropped.
#[derive(Debug, Default, Clone)]
pub struct ScriptHealthChecker;

impl ScriptHealthChecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthChecker for ScriptHealthChecker {
    async fn check(&self, script_path: &Path, timeout: Duration) -> Result<bool, HealthCheckError> {
        let script = script_path.display().to_string();

        let mut child = Command::new(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HealthCheckError::Spawn {
                script: script.clone(),
                source,
            })?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(script = %script, exit_code = ?status.code(), "health check finished");
                Ok(status.success())
            }
            Ok(Err(source)) => Err(HealthCheckError::Wait { script, source }),
            Err(_) => {
                let _ = child.kill().await;
                Err(HealthCheckError::Timeout {
                    script,
                    after: timeout,
                })
            }
        }
    }
}

// =============================================================================
// Mock checker
// =============================================================================

/// Scripted result for [`MockHealthChecker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockResult {
    Healthy,
    Unhealthy,
    Error,
    /// Never completes; used to exercise cancellation mid-evaluation.
    Hang,
}

/// Mock checker returning scripted results per script path.
///
/// Unknown scripts are healthy.
#[derive(Debug, Default)]
pub struct MockHealthChecker {
    results: Mutex<HashMap<PathBuf, MockResult>>,
    calls: Mutex<Vec<PathBuf>>,
}

impl MockHealthChecker {
    /// Create a new mock checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result for a script.
    pub fn set(&self, script_path: impl Into<PathBuf>, result: MockResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(script_path.into(), result);
    }

    /// Number of evaluations started so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl HealthChecker for MockHealthChecker {
    async fn check(&self, script_path: &Path, timeout: Duration) -> Result<bool, HealthCheckError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(script_path.to_path_buf());

        let result = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(script_path)
            .copied()
            .unwrap_or(MockResult::Healthy);

        debug!(script = %script_path.display(), result = ?result, "[MOCK] health check");

        match result {
            MockResult::Healthy => Ok(true),
            MockResult::Unhealthy => Ok(false),
            MockResult::Error => Err(HealthCheckError::Spawn {
                script: script_path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock failure"),
            }),
            MockResult::Hang => {
                std::future::pending::<()>().await;
                Err(HealthCheckError::Timeout {
                    script: script_path.display().to_string(),
                    after: timeout,
                })
            }
        }
    }
}
