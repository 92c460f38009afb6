//! Public bridge handle.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::{BridgeBuilder, BridgeConfig, ReclaimHook};
use crate::error::Result;
use crate::monitor::HealthMonitor;
use crate::registry::RequestKind;
use crate::supervisor::{BridgeStatus, Supervisor, WorkerState};

/// Handle to a supervised worker process.
///
/// Cheap to clone; every clone talks to the same worker. The worker is
/// spawned lazily by the first `start` or `send_command`, and killed when
/// the last handle is dropped.
///
/// ```no_run
/// use serde_json::json;
/// use worker_bridge::Bridge;
///
/// # async fn run() -> worker_bridge::Result<()> {
/// let bridge = Bridge::builder("python3").arg("python_server.py").build();
/// bridge.start(false).await?;
///
/// let colors = bridge
///     .send_command("extract_colors", json!({"image_data": "..."}))
///     .await?;
/// println!("{}", colors);
///
/// bridge.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    supervisor: Arc<Supervisor>,
    reclaim_hook: Option<ReclaimHook>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
        self.supervisor.shutdown_now();
    }
}

impl Bridge {
    /// Create a bridge from a complete configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self::from_parts(config, None)
    }

    /// Start configuring a bridge for `program`.
    pub fn builder(program: impl Into<PathBuf>) -> BridgeBuilder {
        BridgeBuilder::new(program)
    }

    pub(crate) fn from_parts(config: BridgeConfig, reclaim_hook: Option<ReclaimHook>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                supervisor: Arc::new(Supervisor::new(config)),
                reclaim_hook,
                monitor: Mutex::new(None),
            }),
        }
    }

    fn supervisor(&self) -> &Arc<Supervisor> {
        &self.inner.supervisor
    }

    /// The configuration this bridge was built with.
    pub fn config(&self) -> &BridgeConfig {
        self.supervisor().config()
    }

    /// Start the worker.
    ///
    /// A no-op while the worker is running unless `force_restart` is set.
    /// Forcing also resets an exhausted restart budget. Concurrent calls
    /// never spawn a second process.
    pub async fn start(&self, force_restart: bool) -> Result<()> {
        self.ensure_monitor();
        self.supervisor().start(force_restart).await
    }

    /// Stop the worker.
    ///
    /// Sends the exit command, waits the configured grace period, then
    /// kills. Every pending request fails with `ProcessTerminated`.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.stop_monitor();
        self.supervisor().stop().await
    }

    /// Stop and start the worker, drawing from the restart budget.
    ///
    /// Returns `false` without touching the process once the budget is
    /// spent.
    pub async fn restart(&self) -> Result<bool> {
        self.ensure_monitor();
        self.supervisor().restart().await
    }

    /// Start the worker if it is not running, waiting behind any start
    /// already in progress.
    pub async fn ensure_running(&self) -> Result<()> {
        self.start(false).await
    }

    /// Send a command with the default deadline.
    pub async fn send_command(&self, command: &str, params: Value) -> Result<Value> {
        let timeout = self.config().default_timeout;
        self.send_command_timeout(command, params, timeout).await
    }

    /// Send a command and wait for its result.
    ///
    /// Object `params` are flattened into the request next to `id` and
    /// `command`; other values travel under a `params` key. The worker is
    /// started if needed. The deadline covers time spent queued.
    pub async fn send_command_timeout(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_monitor();
        self.supervisor()
            .send(command, &params, timeout, RequestKind::Command)
            .await
    }

    /// Typed variant of [`send_command`](Self::send_command).
    pub async fn call<P, R>(&self, command: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.send_command(command, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the worker whether its environment is usable.
    ///
    /// Sends the health command with the probe deadline and reports whether
    /// the reply carries `status: "ok"`. Any error counts as unhealthy.
    pub async fn check_health(&self) -> bool {
        let health = &self.config().health;
        match self
            .send_command_timeout(&health.health_command, Value::Null, health.probe_timeout)
            .await
        {
            Ok(report) => {
                let healthy = report.get("status").and_then(Value::as_str) == Some("ok");
                if !healthy {
                    tracing::warn!(report = %report, "Worker reported unhealthy environment");
                }
                healthy
            }
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed");
                false
            }
        }
    }

    /// Restart an idle worker that fails its health check.
    ///
    /// Returns whether a restart happened. Does nothing while requests are
    /// pending or the worker is not running.
    pub async fn perform_idle_maintenance(&self) -> Result<bool> {
        let status = self.status();
        if status.state != WorkerState::Running || status.pending_requests > 0 {
            return Ok(false);
        }
        if self.check_health().await {
            return Ok(false);
        }

        tracing::info!("Idle worker failed its health check, restarting");
        self.restart().await
    }

    /// Snapshot of the worker and request state.
    pub fn status(&self) -> BridgeStatus {
        self.supervisor().status()
    }

    fn ensure_monitor(&self) {
        let health = &self.config().health;
        if !health.enabled {
            return;
        }

        let mut slot = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let monitor = HealthMonitor::new(
            Arc::clone(self.supervisor()),
            health.clone(),
            self.inner.reclaim_hook.clone(),
        );
        *slot = Some(monitor.spawn());
    }

    fn stop_monitor(&self) {
        let task = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[tokio::test]
    async fn test_missing_program_reports_spawn_error() {
        let bridge = Bridge::builder("/nonexistent/worker-bridge-test-binary")
            .startup_delay(Duration::from_millis(1))
            .without_health_monitor()
            .build();

        let err = bridge.start(false).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { ref program, .. } if program.contains("nonexistent")));
        assert_eq!(bridge.status().state, WorkerState::Crashed);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let bridge = Bridge::builder("unused").without_health_monitor().build();
        let clone = bridge.clone();
        clone.stop().await.unwrap();
        assert_eq!(bridge.status().state, WorkerState::Stopped);
        assert_eq!(bridge.status().max_restarts, 5);
    }

    #[tokio::test]
    async fn test_monitor_lifecycle() {
        let bridge = Bridge::builder("/nonexistent/worker-bridge-test-binary").build();
        let _ = bridge.start(false).await;
        assert!(bridge.inner.monitor.lock().unwrap().is_some());

        bridge.stop().await.unwrap();
        assert!(bridge.inner.monitor.lock().unwrap().is_none());
    }
}
