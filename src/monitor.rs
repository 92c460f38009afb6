//! Periodic health monitor.
//!
//! Runs on a fixed interval regardless of traffic. Each tick, while the
//! worker is running:
//!
//! 1. Host memory above the warning threshold issues a reclamation hint
//!    (pooled buffers dropped, user hook invoked); above critical it is also
//!    logged as an error.
//! 2. Worker RSS above its limit restarts the worker.
//! 3. The memory probe is sent with its own short deadline. A reply with
//!    `restart_needed: true`, or no reply in time, restarts the worker.
//! 4. A worker that has served its quota is recycled once idle.
//!
//! Restarts in steps 2 and 3 draw from the restart budget; recycling does not.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{HealthConfig, ReclaimHook};
use crate::memory::{host_rss_mib, process_rss_mib};
use crate::registry::RequestKind;
use crate::supervisor::Supervisor;

/// Host memory classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pressure {
    Normal,
    Warning,
    Critical,
}

/// Why the monitor restarted the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartCause {
    WorkerMemory,
    ProbeRequested,
    ProbeTimeout,
}

/// Result of one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Worker not running.
    Skipped,
    Healthy,
    Restarted(RestartCause),
    /// A restart was due but the budget is spent.
    RestartRefused(RestartCause),
    /// The replacement worker could not be started.
    RestartFailed(RestartCause),
    Recycled,
    /// Quota reached but requests are in flight.
    RecycleDeferred,
}

pub(crate) struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    config: HealthConfig,
    reclaim_hook: Option<ReclaimHook>,
}

impl HealthMonitor {
    pub(crate) fn new(
        supervisor: Arc<Supervisor>,
        config: HealthConfig,
        reclaim_hook: Option<ReclaimHook>,
    ) -> Self {
        Self {
            supervisor,
            config,
            reclaim_hook,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(interval_ms = period.as_millis() as u64, "Health monitor started");
        loop {
            ticker.tick().await;
            let outcome = self.tick().await;
            tracing::debug!(outcome = ?outcome, "Health check finished");
        }
    }

    pub(crate) async fn tick(&self) -> TickOutcome {
        let Some(generation) = self.supervisor.running_generation() else {
            return TickOutcome::Skipped;
        };

        self.check_host_memory();

        if let Some(pid) = self.supervisor.pid() {
            if let Some(rss_mib) = process_rss_mib(pid) {
                if rss_mib > self.config.worker_limit_mib {
                    tracing::warn!(
                        pid,
                        rss_mib,
                        limit_mib = self.config.worker_limit_mib,
                        "Worker exceeded memory limit"
                    );
                    return self.restart(RestartCause::WorkerMemory).await;
                }
            }
        }

        let probe = self
            .supervisor
            .send(
                &self.config.probe_command,
                &Value::Null,
                self.config.probe_timeout,
                RequestKind::Probe,
            )
            .await;
        match probe {
            Ok(report) if restart_requested(&report) => {
                tracing::warn!(report = %report, "Worker asked to be restarted");
                return self.restart(RestartCause::ProbeRequested).await;
            }
            Ok(report) => {
                tracing::debug!(report = %report, "Memory probe ok");
            }
            Err(e) if e.is_timeout() => {
                tracing::warn!(
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "Worker did not answer memory probe"
                );
                return self.restart(RestartCause::ProbeTimeout).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Memory probe failed");
            }
        }

        let served = self.supervisor.served_count();
        if served >= self.config.max_served_before_restart {
            if !self.supervisor.registry().is_empty() {
                tracing::debug!(served, "Service quota reached, worker busy");
                return TickOutcome::RecycleDeferred;
            }
            match self.supervisor.recycle(generation).await {
                Ok(true) => return TickOutcome::Recycled,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Failed to recycle worker");
                }
            }
        }

        TickOutcome::Healthy
    }

    async fn restart(&self, cause: RestartCause) -> TickOutcome {
        match self.supervisor.restart().await {
            Ok(true) => TickOutcome::Restarted(cause),
            Ok(false) => TickOutcome::RestartRefused(cause),
            Err(e) => {
                tracing::error!(cause = ?cause, error = %e, "Health restart failed");
                TickOutcome::RestartFailed(cause)
            }
        }
    }

    fn check_host_memory(&self) {
        let Some(rss_mib) = host_rss_mib() else {
            return;
        };

        match classify(rss_mib, &self.config) {
            Pressure::Normal => return,
            Pressure::Warning => {
                tracing::warn!(
                    rss_mib,
                    warning_mib = self.config.host_warning_mib,
                    "Host memory usage high"
                );
            }
            Pressure::Critical => {
                tracing::error!(
                    rss_mib,
                    critical_mib = self.config.host_critical_mib,
                    "Host memory usage critical"
                );
            }
        }
        self.reclaim();
    }

    fn reclaim(&self) {
        let dropped = self.supervisor.pool().shrink();
        if let Some(hook) = &self.reclaim_hook {
            hook();
        }
        tracing::debug!(dropped_buffers = dropped, "Issued memory reclamation hint");
    }
}

fn classify(rss_mib: u64, config: &HealthConfig) -> Pressure {
    if rss_mib > config.host_critical_mib {
        Pressure::Critical
    } else if rss_mib > config.host_warning_mib {
        Pressure::Warning
    } else {
        Pressure::Normal
    }
}

fn restart_requested(report: &Value) -> bool {
    report
        .get("restart_needed")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        let config = HealthConfig::default();
        assert_eq!(classify(100, &config), Pressure::Normal);
        assert_eq!(classify(300, &config), Pressure::Normal);
        assert_eq!(classify(301, &config), Pressure::Warning);
        assert_eq!(classify(401, &config), Pressure::Critical);
    }

    #[test]
    fn test_restart_requested() {
        assert!(restart_requested(&json!({"restart_needed": true, "rss_mb": 900})));
        assert!(!restart_requested(&json!({"restart_needed": false})));
        assert!(!restart_requested(&json!({"restart_needed": "yes"})));
        assert!(!restart_requested(&json!({})));
        assert!(!restart_requested(&Value::Null));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_pressure_runs_hook_and_drops_pooled_buffers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let supervisor = Arc::new(Supervisor::new(crate::BridgeConfig::new("unused")));
        let pool = supervisor.pool();
        let buffers: Vec<_> = (0..pool.max_buffers()).map(|_| pool.get_buffer()).collect();
        for buf in buffers {
            pool.release_buffer(buf);
        }
        assert!(pool.available() > 0);

        let calls = Arc::new(AtomicUsize::new(0));
        let hook: ReclaimHook = {
            let calls = calls.clone();
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        // Any resident process is above a zero threshold.
        let config = HealthConfig {
            host_warning_mib: 0,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(supervisor.clone(), config, Some(hook));

        monitor.check_host_memory();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.pool().available(), 0);
    }

    #[test]
    fn test_normal_memory_leaves_pool_alone() {
        let supervisor = Arc::new(Supervisor::new(crate::BridgeConfig::new("unused")));
        let buf = supervisor.pool().get_buffer();
        supervisor.pool().release_buffer(buf);

        let config = HealthConfig {
            host_warning_mib: u64::MAX - 1,
            host_critical_mib: u64::MAX,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(supervisor.clone(), config, None);
        monitor.check_host_memory();
        assert_eq!(supervisor.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_tick_skipped_while_stopped() {
        let supervisor = Arc::new(Supervisor::new(crate::BridgeConfig::new("unused")));
        let monitor = HealthMonitor::new(supervisor, HealthConfig::default(), None);
        assert_eq!(monitor.tick().await, TickOutcome::Skipped);
    }
}
