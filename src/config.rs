//! Bridge configuration and the fluent builder.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::Bridge;
use crate::protocol::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS, DEFAULT_MAX_INBOUND_BUFFER, DEFAULT_SENTINEL,
};
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY};

/// Default settle interval between spawning the worker and writing to it.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Default time a worker gets to honor the exit command before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(500);

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default automatic restart budget.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Requests above this size are logged as suspicious (5 MB).
pub const DEFAULT_LARGE_PAYLOAD_WARNING: usize = 5 * 1024 * 1024;

/// stderr fragments that mean the worker ran out of a resource.
pub const DEFAULT_EXHAUSTION_PATTERNS: &[&str] = &[
    "MemoryError",
    "Cannot allocate memory",
    "OutOfMemoryError",
    "MemoryLimit",
    "ResourceExhaustedError",
];

/// Callback invoked when host memory crosses the warning threshold.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Whether the monitor runs at all.
    pub enabled: bool,
    /// Tick period.
    pub interval: Duration,
    /// Command sent to the worker on every tick.
    pub probe_command: String,
    /// Deadline for the probe; a timeout counts as a hung worker.
    pub probe_timeout: Duration,
    /// Command used by [`Bridge::check_health`].
    pub health_command: String,
    /// Host RSS above which a reclamation hint is issued (MiB).
    pub host_warning_mib: u64,
    /// Host RSS above which an error is logged (MiB).
    pub host_critical_mib: u64,
    /// Worker RSS above which the worker is restarted (MiB).
    pub worker_limit_mib: u64,
    /// Requests served before the worker is recycled even if healthy.
    pub max_served_before_restart: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            probe_command: "check_memory".to_string(),
            probe_timeout: Duration::from_secs(5),
            health_command: "check_environment".to_string(),
            host_warning_mib: 300,
            host_critical_mib: 400,
            worker_limit_mib: 500,
            max_served_before_restart: 20,
        }
    }
}

/// Payload buffer pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of each pooled buffer.
    pub buffer_size: usize,
    /// Buffers kept on the free list.
    pub max_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffers: DEFAULT_MAX_BUFFERS,
        }
    }
}

/// Everything the bridge needs to launch and supervise a worker.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Worker executable.
    pub program: PathBuf,
    /// Worker arguments.
    pub args: Vec<OsString>,
    /// Extra environment for the worker.
    pub env: Vec<(OsString, OsString)>,
    /// Worker working directory.
    pub current_dir: Option<PathBuf>,
    /// Settle interval after spawn.
    pub startup_delay: Duration,
    /// Grace period for the exit command.
    pub stop_grace: Duration,
    /// Deadline used by `send_command`.
    pub default_timeout: Duration,
    /// Automatic restart budget.
    pub max_restarts: u32,
    /// Response terminator.
    pub sentinel: String,
    /// Hard ceiling for undecoded worker output.
    pub max_inbound_buffer: usize,
    /// Request size above which a warning is logged.
    pub large_payload_warning: usize,
    /// stderr fragments that trigger a proactive restart.
    pub exhaustion_patterns: Vec<String>,
    /// Writer task settings.
    pub writer: WriterConfig,
    /// Health monitor settings.
    pub health: HealthConfig,
    /// Payload buffer pool settings.
    pub pool: PoolConfig,
}

impl BridgeConfig {
    /// Configuration for `program` with every other setting at its default.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            startup_delay: DEFAULT_STARTUP_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            default_timeout: DEFAULT_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            sentinel: DEFAULT_SENTINEL.to_string(),
            max_inbound_buffer: DEFAULT_MAX_INBOUND_BUFFER,
            large_payload_warning: DEFAULT_LARGE_PAYLOAD_WARNING,
            exhaustion_patterns: DEFAULT_EXHAUSTION_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            writer: WriterConfig {
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            },
            health: HealthConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Program name for logs and errors.
    pub(crate) fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Builder for configuring and creating a [`Bridge`].
///
/// ```no_run
/// use std::time::Duration;
/// use worker_bridge::BridgeBuilder;
///
/// let bridge = BridgeBuilder::python("python_server.py")
///     .default_timeout(Duration::from_secs(60))
///     .max_restarts(3)
///     .build();
/// ```
pub struct BridgeBuilder {
    config: BridgeConfig,
    reclaim_hook: Option<ReclaimHook>,
}

impl BridgeBuilder {
    /// Create a builder for an arbitrary worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            config: BridgeConfig::new(program),
            reclaim_hook: None,
        }
    }

    /// Create a builder for a Python worker script.
    ///
    /// Runs `python3 -u <script>` with unbuffered output, the pymalloc
    /// allocator, the cyclic GC enabled and (on Linux) an aggressive
    /// `malloc_trim` threshold so the worker hands memory back to the OS.
    pub fn python(script: impl Into<PathBuf>) -> Self {
        let script: PathBuf = script.into();
        let mut builder = Self::new("python3")
            .arg("-u")
            .arg(script.into_os_string())
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONMALLOC", "pymalloc")
            .env("PYTHONGC", "enabled");
        if cfg!(target_os = "linux") {
            builder = builder.env("MALLOC_TRIM_THRESHOLD_", "65536");
        }
        builder
    }

    /// Append a worker argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    /// Append several worker arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a worker environment variable.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    /// Set the worker working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.current_dir = Some(dir.into());
        self
    }

    /// Set the settle interval after spawn.
    ///
    /// Default: 1 second
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.config.startup_delay = delay;
        self
    }

    /// Set the grace period for the exit command.
    ///
    /// Default: 500 ms
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Set the deadline used by `send_command`.
    ///
    /// Default: 30 seconds
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the automatic restart budget.
    ///
    /// Default: 5
    pub fn max_restarts(mut self, max: u32) -> Self {
        self.config.max_restarts = max;
        self
    }

    /// Set the response sentinel.
    ///
    /// Default: `__END__`
    pub fn sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.config.sentinel = sentinel.into();
        self
    }

    /// Set the ceiling for undecoded worker output.
    ///
    /// Default: 2 MiB
    pub fn max_inbound_buffer(mut self, bytes: usize) -> Self {
        self.config.max_inbound_buffer = bytes;
        self
    }

    /// Set the request size that triggers a warning.
    ///
    /// Default: 5 MB
    pub fn large_payload_warning(mut self, bytes: usize) -> Self {
        self.config.large_payload_warning = bytes;
        self
    }

    /// Add a stderr fragment that triggers a proactive restart.
    pub fn exhaustion_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.exhaustion_patterns.push(pattern.into());
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Replace the health monitor settings.
    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    /// Set the health monitor tick period.
    ///
    /// Default: 60 seconds
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.config.health.interval = interval;
        self
    }

    /// Set the deadline for the monitor's memory check. A worker that misses
    /// it is restarted.
    ///
    /// Default: 5 seconds
    pub fn memory_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.health.probe_timeout = timeout;
        self
    }

    /// Set the worker RSS (MiB) above which the monitor restarts it.
    ///
    /// Default: 500
    pub fn worker_memory_limit_mib(mut self, limit: u64) -> Self {
        self.config.health.worker_limit_mib = limit;
        self
    }

    /// Disable the health monitor.
    pub fn without_health_monitor(mut self) -> Self {
        self.config.health.enabled = false;
        self
    }

    /// Set how many requests a worker serves before it is recycled.
    ///
    /// Default: 20
    pub fn max_served_before_restart(mut self, max: u64) -> Self {
        self.config.health.max_served_before_restart = max;
        self
    }

    /// Replace the buffer pool settings.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Register a callback run when host memory is under pressure.
    pub fn on_memory_pressure<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reclaim_hook = Some(Arc::new(hook));
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Build the bridge. No process is spawned until the first `start` or
    /// `send_command`.
    pub fn build(self) -> Bridge {
        Bridge::from_parts(self.config, self.reclaim_hook)
    }
}

impl From<BridgeConfig> for BridgeBuilder {
    fn from(config: BridgeConfig) -> Self {
        Self {
            config,
            reclaim_hook: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new("worker");
        assert_eq!(config.startup_delay, Duration::from_secs(1));
        assert_eq!(config.stop_grace, Duration::from_millis(500));
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.sentinel, "__END__");
        assert_eq!(config.max_inbound_buffer, 2 * 1024 * 1024);
        assert_eq!(config.writer.channel_capacity, 1024);
        assert!(config
            .exhaustion_patterns
            .iter()
            .any(|p| p == "MemoryError"));

        let health = &config.health;
        assert!(health.enabled);
        assert_eq!(health.interval, Duration::from_secs(60));
        assert_eq!(health.probe_command, "check_memory");
        assert_eq!(health.probe_timeout, Duration::from_secs(5));
        assert_eq!(
            (health.host_warning_mib, health.host_critical_mib),
            (300, 400)
        );
        assert_eq!(health.max_served_before_restart, 20);

        assert_eq!(config.pool.buffer_size, 5 * 1024 * 1024);
        assert_eq!(config.pool.max_buffers, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = BridgeBuilder::new("worker")
            .arg("--serve")
            .env("MODE", "test")
            .startup_delay(Duration::from_millis(20))
            .max_restarts(2)
            .sentinel("<<EOM>>")
            .max_served_before_restart(3)
            .memory_check_timeout(Duration::from_millis(250))
            .worker_memory_limit_mib(64)
            .without_health_monitor();

        let config = builder.config();
        assert_eq!(config.args, vec![OsString::from("--serve")]);
        assert_eq!(
            config.env,
            vec![(OsString::from("MODE"), OsString::from("test"))]
        );
        assert_eq!(config.startup_delay, Duration::from_millis(20));
        assert_eq!(config.max_restarts, 2);
        assert_eq!(config.sentinel, "<<EOM>>");
        assert_eq!(config.health.max_served_before_restart, 3);
        assert_eq!(config.health.probe_timeout, Duration::from_millis(250));
        assert_eq!(config.health.worker_limit_mib, 64);
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_python_environment() {
        let builder = BridgeBuilder::python("server.py");
        let config = builder.config();

        assert_eq!(config.program, PathBuf::from("python3"));
        assert_eq!(
            config.args,
            vec![OsString::from("-u"), OsString::from("server.py")]
        );
        let has = |key: &str, value: &str| {
            config
                .env
                .iter()
                .any(|(k, v)| k == key && v == value)
        };
        assert!(has("PYTHONUNBUFFERED", "1"));
        assert!(has("PYTHONMALLOC", "pymalloc"));
        assert!(has("PYTHONGC", "enabled"));
        assert_eq!(
            has("MALLOC_TRIM_THRESHOLD_", "65536"),
            cfg!(target_os = "linux")
        );
    }
}
