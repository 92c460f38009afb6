//! Worker process supervision.
//!
//! The supervisor owns the single worker process and everything attached to
//! it: the writer task on stdin, a reader task on stdout feeding a
//! [`FramedChannel`], a stderr task, and an exit watcher that owns the
//! `Child`. Lifecycle operations (start, stop, restart, recycle) are
//! serialized by an async mutex, so concurrent starts never spawn a second
//! process; late callers wait and then find the worker running.
//!
//! Each spawned process gets a generation number. Tasks of a previous
//! generation may still be draining when a new process is up; anything they
//! report is checked against the current generation and ignored when stale.
//!
//! # Exit handling
//!
//! | Cause                        | Pending requests          | Next state | Restart              |
//! |------------------------------|---------------------------|------------|----------------------|
//! | `stop()`                     | all rejected              | Stopped    | never                |
//! | `restart()` / recycle        | in-flight rejected        | Running    | immediate            |
//! | exit code 0                  | all rejected              | Stopped    | never                |
//! | non-zero code or signal      | all rejected              | Crashed    | only if work pending |
//! | exhaustion line on stderr    | in-flight rejected        | Running    | immediate            |
//! | write to stdin failed        | in-flight rejected        | Crashed    | immediate            |
//! | spawn failed                 | all rejected              | Crashed    | on next request      |
//!
//! Automatic restarts draw from the restart budget. A crash with nothing
//! pending draws nothing: the worker stays Crashed and the next request
//! starts it lazily. A spawn failure that rejected work draws one unit, so a
//! missing binary cannot be retried forever.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    encode_exit_request, encode_request_into, BufferPool, Frame, FramedChannel, Message,
    EXIT_REQUEST_ID,
};
use crate::registry::{RequestKind, RequestRegistry, Route};
use crate::writer::{spawn_writer_task, OutboundRequest, WriterHandle};

/// Read buffer size for worker stdout.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long to wait for the OS to reap a killed worker.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No process.
    Stopped,
    /// Spawned, settling, or draining the queue.
    Starting,
    /// Accepting requests.
    Running,
    /// Exited with a non-zero code, a signal, or failed to spawn.
    Crashed,
}

/// Point-in-time view of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeStatus {
    /// Worker lifecycle state.
    pub state: WorkerState,
    /// Worker pid while a process exists.
    pub pid: Option<u32>,
    /// Time since the current process was spawned.
    pub uptime: Option<Duration>,
    /// Commands completed by the current process.
    pub served_count: u64,
    /// Restarts drawn from the budget since the last successful start.
    pub restart_count: u32,
    /// Restart budget.
    pub max_restarts: u32,
    /// Whether the budget is spent. Only `start(true)` clears this.
    pub budget_exhausted: bool,
    /// Requests awaiting completion, queued ones included.
    pub pending_requests: usize,
    /// Requests waiting for the worker to become ready.
    pub queued_requests: usize,
}

/// Restart budget bookkeeping.
#[derive(Debug, Default)]
struct RestartPolicy {
    count: u32,
    max: u32,
    exhausted: bool,
    /// Generation whose first successful response resets `count`.
    awaiting_success: Option<u64>,
}

impl RestartPolicy {
    fn new(max: u32) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    /// Draw one restart. Returns the new count, or `None` once exhausted.
    fn try_consume(&mut self) -> Option<u32> {
        if self.exhausted || self.count >= self.max {
            self.exhausted = true;
            return None;
        }
        self.count += 1;
        Some(self.count)
    }

    fn note_success(&mut self, generation: u64) {
        if self.awaiting_success == Some(generation) {
            self.awaiting_success = None;
            if self.count > 0 {
                tracing::debug!(
                    generation,
                    previous = self.count,
                    "Worker answered after start, restart count reset"
                );
            }
            self.count = 0;
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.exhausted = false;
    }
}

/// Which requests a stop cancels.
#[derive(Debug, Clone, Copy)]
enum StopScope {
    /// Everything, queued requests included.
    All,
    /// Requests already written to the worker; the queue carries over to the
    /// next process.
    InFlight,
}

/// One spawned worker process.
struct WorkerProcess {
    generation: u64,
    pid: Option<u32>,
    writer: WriterHandle,
    writer_task: AbortHandle,
    /// stdout and stderr readers.
    io_tasks: Vec<JoinHandle<()>>,
    /// Set before an intentional shutdown so the exit watcher stays quiet.
    stopping: Arc<AtomicBool>,
    /// Dropping or firing this makes the exit watcher kill the child.
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// State readable without the lifecycle lock.
struct Shared {
    state: WorkerState,
    generation: u64,
    pid: Option<u32>,
    started_at: Option<Instant>,
    served: u64,
    writer: Option<WriterHandle>,
}

pub(crate) struct Supervisor {
    config: BridgeConfig,
    registry: Arc<RequestRegistry>,
    pool: Arc<BufferPool>,
    lifecycle: AsyncMutex<Option<WorkerProcess>>,
    shared: Mutex<Shared>,
    policy: Mutex<RestartPolicy>,
}

impl Supervisor {
    pub(crate) fn new(config: BridgeConfig) -> Self {
        let pool = BufferPool::new(config.pool.max_buffers, config.pool.buffer_size);
        let policy = RestartPolicy::new(config.max_restarts);
        Self {
            config,
            registry: Arc::new(RequestRegistry::new()),
            pool: Arc::new(pool),
            lifecycle: AsyncMutex::new(None),
            shared: Mutex::new(Shared {
                state: WorkerState::Stopped,
                generation: 0,
                pid: None,
                started_at: None,
                served: 0,
                writer: None,
            }),
            policy: Mutex::new(policy),
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_policy(&self) -> MutexGuard<'_, RestartPolicy> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.lock_shared().state
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.lock_shared().pid
    }

    pub(crate) fn served_count(&self) -> u64 {
        self.lock_shared().served
    }

    /// Generation of the current process if it is running.
    pub(crate) fn running_generation(&self) -> Option<u64> {
        let shared = self.lock_shared();
        (shared.state == WorkerState::Running).then_some(shared.generation)
    }

    fn budget_exhausted(&self) -> Option<BridgeError> {
        let policy = self.lock_policy();
        policy.exhausted.then_some(BridgeError::RestartBudgetExhausted {
            max_restarts: policy.max,
        })
    }

    pub(crate) fn status(&self) -> BridgeStatus {
        let (state, pid, uptime, served_count) = {
            let shared = self.lock_shared();
            (
                shared.state,
                shared.pid,
                shared.started_at.map(|t| t.elapsed()),
                shared.served,
            )
        };
        let (restart_count, max_restarts, budget_exhausted) = {
            let policy = self.lock_policy();
            (policy.count, policy.max, policy.exhausted)
        };
        BridgeStatus {
            state,
            pid,
            uptime,
            served_count,
            restart_count,
            max_restarts,
            budget_exhausted,
            pending_requests: self.registry.len(),
            queued_requests: self.registry.queued_len(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the worker.
    ///
    /// Without `force` this is a no-op while running, and fails while the
    /// restart budget is exhausted. With `force` the budget is reset and any
    /// existing process is replaced.
    pub(crate) async fn start(self: &Arc<Self>, force: bool) -> Result<()> {
        let mut guard = self.lifecycle.lock().await;

        if force {
            self.lock_policy().reset();
        } else {
            if self.state() == WorkerState::Running {
                if let Some(process) = guard.as_ref() {
                    // Anything queued while this call waited goes out now.
                    self.drain_queue(process.generation, &process.writer)
                        .await;
                    return Ok(());
                }
            }
            if let Some(err) = self.budget_exhausted() {
                let max_restarts = self.config.max_restarts;
                self.registry
                    .reject_queued(|| BridgeError::RestartBudgetExhausted { max_restarts });
                return Err(err);
            }
        }

        self.stop_locked(&mut guard, StopScope::InFlight, "worker restarting")
            .await;
        self.start_locked(&mut guard).await
    }

    /// Stop the worker and cancel every pending request.
    pub(crate) async fn stop(&self) -> Result<()> {
        let mut guard = self.lifecycle.lock().await;
        self.stop_locked(&mut guard, StopScope::All, "worker stopped")
            .await;
        Ok(())
    }

    /// Restart the worker, drawing from the budget.
    ///
    /// Returns `Ok(false)` without touching the process once the budget is
    /// spent.
    pub(crate) async fn restart(self: &Arc<Self>) -> Result<bool> {
        let mut guard = self.lifecycle.lock().await;

        let Some(count) = self.lock_policy().try_consume() else {
            tracing::error!(
                max_restarts = self.config.max_restarts,
                "Restart budget exhausted, refusing to restart worker"
            );
            return Ok(false);
        };

        tracing::info!(restart_count = count, "Restarting worker");
        self.stop_locked(&mut guard, StopScope::InFlight, "worker restarting")
            .await;
        self.start_locked(&mut guard).await?;
        Ok(true)
    }

    /// Replace a worker that reached its service quota. Does not touch the
    /// restart budget. No-op if `generation` is no longer current.
    pub(crate) async fn recycle(self: &Arc<Self>, generation: u64) -> Result<bool> {
        let mut guard = self.lifecycle.lock().await;
        if guard.as_ref().map(|p| p.generation) != Some(generation) {
            return Ok(false);
        }

        tracing::info!(
            generation,
            served = self.served_count(),
            "Recycling worker after service quota"
        );
        self.stop_locked(&mut guard, StopScope::InFlight, "worker recycled")
            .await;
        self.start_locked(&mut guard).await?;
        Ok(true)
    }

    /// Kill the worker without waiting. Used when the last bridge handle is
    /// dropped.
    pub(crate) fn shutdown_now(&self) {
        self.registry.close();
        if let Ok(mut guard) = self.lifecycle.try_lock() {
            if let Some(mut process) = guard.take() {
                process.stopping.store(true, Ordering::Release);
                if let Some(kill) = process.kill.take() {
                    let _ = kill.send(());
                }
                for task in process.io_tasks {
                    task.abort();
                }
                process.writer_task.abort();
            }
        }
        self.mark_stopped();
        self.registry
            .reject_all(|| BridgeError::ProcessTerminated("bridge dropped".to_string()));
    }

    fn mark_stopped(&self) {
        let mut shared = self.lock_shared();
        shared.state = WorkerState::Stopped;
        shared.pid = None;
        shared.started_at = None;
        shared.served = 0;
        shared.writer = None;
    }

    async fn stop_locked(
        &self,
        guard: &mut Option<WorkerProcess>,
        scope: StopScope,
        reason: &str,
    ) {
        self.registry.close();

        if let Some(mut process) = guard.take() {
            process.stopping.store(true, Ordering::Release);
            let pid = process.pid.unwrap_or_default();
            let grace = self.config.stop_grace;

            let already_exited = *process.exited.borrow();
            if !already_exited {
                let exit = OutboundRequest::control(encode_exit_request());
                let _ = tokio::time::timeout(grace, process.writer.send(exit)).await;

                if wait_for_exit(&mut process.exited, grace).await {
                    tracing::debug!(pid, "Worker exited on request");
                } else {
                    tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Worker ignored exit command, killing");
                    if let Some(kill) = process.kill.take() {
                        let _ = kill.send(());
                    }
                    if !wait_for_exit(&mut process.exited, KILL_WAIT).await {
                        tracing::error!(pid, "Worker did not exit after kill");
                    }
                }
            }

            for task in process.io_tasks {
                task.abort();
            }
            process.writer_task.abort();
            tracing::info!(pid, generation = process.generation, reason, "Worker stopped");
        }

        self.mark_stopped();

        let make_error = || BridgeError::ProcessTerminated(reason.to_string());
        let cancelled = match scope {
            StopScope::All => self.registry.reject_all(make_error),
            StopScope::InFlight => self.registry.reject_dispatched(make_error),
        };
        if cancelled > 0 {
            tracing::info!(cancelled, reason, "Cancelled pending requests");
        }
    }

    async fn start_locked(self: &Arc<Self>, guard: &mut Option<WorkerProcess>) -> Result<()> {
        let generation = {
            let mut shared = self.lock_shared();
            shared.generation += 1;
            shared.state = WorkerState::Starting;
            shared.generation
        };
        self.registry.close();

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.current_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.fail_start(e.to_string())),
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(self.fail_start("worker stdio was not captured".to_string()));
        };
        let pid = child.id();

        let stopping = Arc::new(AtomicBool::new(false));
        let (writer, writer_task) = spawn_writer_task(
            stdin,
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            self.config.writer.clone(),
        );
        let writer_abort = writer_task.abort_handle();
        tokio::spawn(watch_writer(
            Arc::clone(self),
            writer_task,
            generation,
            Arc::clone(&stopping),
        ));

        let channel =
            FramedChannel::with_limits(&self.config.sentinel, self.config.max_inbound_buffer);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let io_tasks = vec![
            tokio::spawn(read_stdout(Arc::clone(self), stdout, channel, generation)),
            tokio::spawn(read_stderr(Arc::clone(self), stderr, generation, pid)),
        ];
        tokio::spawn(watch_exit(
            Arc::clone(self),
            child,
            generation,
            Arc::clone(&stopping),
            kill_rx,
            exited_tx,
        ));

        {
            let mut shared = self.lock_shared();
            shared.pid = pid;
            shared.started_at = Some(Instant::now());
            shared.served = 0;
            shared.writer = Some(writer.clone());
        }
        *guard = Some(WorkerProcess {
            generation,
            pid,
            writer: writer.clone(),
            writer_task: writer_abort,
            io_tasks,
            stopping,
            kill: Some(kill_tx),
            exited: exited_rx,
        });

        tracing::info!(
            pid = pid.unwrap_or_default(),
            generation,
            program = %self.config.program_name(),
            "Worker process spawned"
        );

        tokio::time::sleep(self.config.startup_delay).await;

        {
            let mut shared = self.lock_shared();
            if shared.generation != generation || shared.state != WorkerState::Starting {
                return Err(BridgeError::ProcessTerminated(
                    "worker exited during startup".to_string(),
                ));
            }
            shared.state = WorkerState::Running;
        }
        self.lock_policy().awaiting_success = Some(generation);

        self.drain_queue(generation, &writer).await;
        tracing::info!(pid = pid.unwrap_or_default(), generation, "Worker ready");
        Ok(())
    }

    fn fail_start(&self, reason: String) -> BridgeError {
        let program = self.config.program_name();
        tracing::error!(program = %program, reason = %reason, "Failed to spawn worker");

        {
            let mut shared = self.lock_shared();
            shared.state = WorkerState::Crashed;
            shared.pid = None;
            shared.started_at = None;
            shared.writer = None;
        }
        let rejected = self.registry.reject_all(|| BridgeError::Spawn {
            program: program.clone(),
            reason: reason.clone(),
        });

        // Work was waiting on this start, so it counts as a restart attempt.
        if rejected > 0 {
            match self.lock_policy().try_consume() {
                Some(count) => {
                    tracing::warn!(restart_count = count, rejected, "Spawn failure drew from restart budget");
                }
                None => {
                    tracing::error!(
                        max_restarts = self.config.max_restarts,
                        "Restart budget exhausted by spawn failures"
                    );
                }
            }
        }
        BridgeError::Spawn { program, reason }
    }

    /// Forward queued requests in issue order, then open the registry.
    async fn drain_queue(self: &Arc<Self>, generation: u64, writer: &WriterHandle) {
        loop {
            let batch = self.registry.take_queue_or_open();
            if batch.is_empty() {
                break;
            }
            tracing::debug!(count = batch.len(), "Forwarding queued requests");
            for (id, payload) in batch {
                self.forward(generation, writer, id, payload).await;
            }
        }
    }

    async fn forward(
        self: &Arc<Self>,
        generation: u64,
        writer: &WriterHandle,
        id: String,
        payload: bytes::BytesMut,
    ) {
        if writer
            .send(OutboundRequest::new(id.clone(), payload))
            .await
            .is_err()
        {
            self.registry.reject(
                &id,
                BridgeError::ProcessTerminated("worker stdin closed".to_string()),
            );
            self.handle_writer_failure(generation, "worker stdin closed");
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Register a request, get it to the worker, and wait for its outcome.
    ///
    /// Commands start the worker if needed. Probes never do; they wait in the
    /// queue or time out.
    pub(crate) async fn send(
        self: &Arc<Self>,
        command: &str,
        params: &Value,
        timeout: Duration,
        kind: RequestKind,
    ) -> Result<Value> {
        if let Some(err) = self.budget_exhausted() {
            return Err(err);
        }

        let id = Uuid::new_v4().to_string();
        let mut payload = self.pool.get_buffer();
        if let Err(e) = encode_request_into(&mut payload, &id, command, params) {
            self.pool.release_buffer(payload);
            return Err(e);
        }

        if payload.len() > self.config.large_payload_warning {
            tracing::warn!(
                id = %id,
                command,
                bytes = payload.len(),
                limit = self.config.large_payload_warning,
                "Large request payload"
            );
        }

        let (completion, route) =
            self.registry
                .register(id.clone(), command, kind, payload, timeout);

        match route {
            Route::Dispatch(payload) => self.dispatch(id, payload).await,
            Route::Queued if kind == RequestKind::Command => {
                tracing::debug!(id = %id, command, "Worker not ready, request queued");
                if let Err(e) = self.start(false).await {
                    tracing::debug!(error = %e, "Start for queued request failed");
                }
            }
            Route::Queued => {}
        }

        completion.await.unwrap_or_else(|_| {
            Err(BridgeError::ProcessTerminated(
                "request dropped without completion".to_string(),
            ))
        })
    }

    async fn dispatch(self: &Arc<Self>, id: String, payload: bytes::BytesMut) {
        let (generation, writer) = {
            let shared = self.lock_shared();
            (shared.generation, shared.writer.clone())
        };
        match writer {
            Some(writer) => self.forward(generation, &writer, id, payload).await,
            None => {
                // The worker died after the route was decided; queue the
                // next requests instead.
                self.registry.close();
                self.registry.reject(&id, BridgeError::NotRunning);
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker events
    // ------------------------------------------------------------------

    async fn handle_frame(&self, generation: u64, frame: Frame) {
        match frame {
            Frame::Malformed { error, preview } => {
                tracing::warn!(generation, error = %error, preview = %preview, "Discarding malformed worker response");
                if let Some(id) = self.registry.reject_oldest(BridgeError::Decode(error)) {
                    tracing::warn!(id = %id, "Rejected oldest pending request after malformed response");
                }
            }
            Frame::Message(message) if message.is_file_fallback() => {
                let id = message.id.clone();
                match read_file_response(message).await {
                    Ok(message) => self.deliver(generation, message),
                    Err(e) => {
                        tracing::error!(id = ?id, error = %e, "Failed to read file response");
                        if let Some(id) = id {
                            self.registry.reject(&id, e);
                        }
                    }
                }
            }
            Frame::Message(message) => self.deliver(generation, message),
        }
    }

    fn deliver(&self, generation: u64, message: Message) {
        let Some(id) = message.id.clone() else {
            tracing::warn!(generation, "Dropping worker response without id");
            return;
        };

        let outcome = message.into_outcome();
        let success = outcome.is_ok();

        match self.registry.complete(&id, outcome) {
            Some(kind) => {
                if kind == RequestKind::Command {
                    let mut shared = self.lock_shared();
                    if shared.generation == generation {
                        shared.served += 1;
                    }
                }
                if success {
                    self.lock_policy().note_success(generation);
                }
            }
            None if id == EXIT_REQUEST_ID => {
                tracing::debug!(generation, "Worker acknowledged exit");
            }
            None => {
                let err = BridgeError::OrphanResponse(id);
                tracing::warn!(generation, error = %err, "Dropping response");
            }
        }
    }

    fn is_exhaustion_line(&self, line: &str) -> bool {
        self.config
            .exhaustion_patterns
            .iter()
            .any(|pattern| line.contains(pattern.as_str()))
    }

    fn handle_unexpected_exit(self: &Arc<Self>, generation: u64, status: std::io::Result<ExitStatus>) {
        let description = match &status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };
        let clean = matches!(&status, Ok(status) if status.success());

        {
            let mut shared = self.lock_shared();
            if shared.generation != generation {
                return;
            }
            shared.state = if clean {
                WorkerState::Stopped
            } else {
                WorkerState::Crashed
            };
            shared.pid = None;
            shared.started_at = None;
            shared.writer = None;
        }
        self.registry.close();

        let rejected = self.registry.reject_all(|| {
            BridgeError::ProcessTerminated(format!("worker exited unexpectedly ({})", description))
        });

        if clean {
            tracing::info!(generation, rejected, "Worker exited cleanly");
            return;
        }

        tracing::error!(generation, status = %description, rejected, "Worker process crashed");
        if rejected > 0 {
            self.request_restart(generation, "crashed with pending work");
        } else {
            tracing::info!(generation, "No pending work, worker will start on next request");
        }
    }

    /// The worker's stdin is gone while the process may still be alive.
    ///
    /// Nothing written from now on can reach the worker, so in-flight
    /// requests fail, new ones queue, and the worker is restarted.
    fn handle_writer_failure(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut shared = self.lock_shared();
            if shared.generation != generation || shared.state != WorkerState::Running {
                return;
            }
            shared.state = WorkerState::Crashed;
            shared.writer = None;
        }
        self.registry.close();

        let rejected = self.registry.reject_dispatched(|| {
            BridgeError::ProcessTerminated(format!("worker stdin failed: {}", reason))
        });
        tracing::error!(generation, reason, rejected, "Worker stdin failed");
        self.request_restart(generation, "stdin write failed");
    }

    /// Draw from the budget and restart the worker in the background.
    fn request_restart(self: &Arc<Self>, generation: u64, reason: &'static str) {
        if self.lock_shared().generation != generation {
            return;
        }

        let Some(count) = self.lock_policy().try_consume() else {
            tracing::error!(
                max_restarts = self.config.max_restarts,
                reason,
                "Restart budget exhausted, worker will not be respawned"
            );
            return;
        };

        tracing::warn!(generation, restart_count = count, reason, "Restarting worker");
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.respawn(generation).await });
    }

    async fn respawn(self: Arc<Self>, generation: u64) {
        let mut guard = self.lifecycle.lock().await;
        if guard.as_ref().map(|p| p.generation) != Some(generation) {
            tracing::debug!(generation, "Worker already replaced, skipping restart");
            return;
        }

        self.stop_locked(&mut guard, StopScope::InFlight, "worker restarting")
            .await;
        if let Err(e) = self.start_locked(&mut guard).await {
            tracing::error!(error = %e, "Automatic restart failed");
        }
    }
}

/// Report a writer task that died on a write error.
async fn watch_writer(
    supervisor: Arc<Supervisor>,
    task: JoinHandle<Result<()>>,
    generation: u64,
    stopping: Arc<AtomicBool>,
) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if stopping.load(Ordering::Acquire) => {
            tracing::debug!(generation, error = %e, "Writer failed after stop");
        }
        Ok(Err(e)) => supervisor.handle_writer_failure(generation, &e.to_string()),
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            tracing::error!(generation, error = %e, "Writer task panicked");
            supervisor.handle_writer_failure(generation, "writer task panicked");
        }
    }
}

/// Wait until the exit watcher reports the process gone.
async fn wait_for_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    let wait = async {
        loop {
            let done = *exited.borrow_and_update();
            if done {
                return;
            }
            if exited.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::time::timeout(limit, wait).await.is_ok()
}

async fn read_stdout(
    supervisor: Arc<Supervisor>,
    mut stdout: ChildStdout,
    mut channel: FramedChannel,
    generation: u64,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(generation, "Worker stdout closed");
                break;
            }
            Ok(n) => {
                for frame in channel.push(&buf[..n]) {
                    supervisor.handle_frame(generation, frame).await;
                }
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }

    if !channel.is_empty() {
        tracing::debug!(
            generation,
            bytes = channel.len(),
            "Discarding unterminated worker output"
        );
    }
}

async fn read_stderr(
    supervisor: Arc<Supervisor>,
    stderr: ChildStderr,
    generation: u64,
    pid: Option<u32>,
) {
    let pid = pid.unwrap_or_default();
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut restart_requested = false;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                tracing::warn!(pid, "worker stderr: {}", text);

                if !restart_requested && supervisor.is_exhaustion_line(text) {
                    restart_requested = true;
                    tracing::warn!(pid, "Worker reported resource exhaustion");
                    supervisor.request_restart(generation, "resource exhaustion reported");
                }
            }
            Err(e) => {
                tracing::debug!(pid, error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
}

async fn watch_exit(
    supervisor: Arc<Supervisor>,
    mut child: Child,
    generation: u64,
    stopping: Arc<AtomicBool>,
    kill: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.kill().await {
                tracing::warn!(generation, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };
    let _ = exited.send(true);

    if stopping.load(Ordering::Acquire) {
        tracing::debug!(generation, status = ?status, "Worker exited after stop");
        return;
    }
    supervisor.handle_unexpected_exit(generation, status);
}

/// Load a response the worker wrote to a side file, then remove the file.
///
/// The file holds either a complete response object or just the result.
async fn read_file_response(message: Message) -> Result<Message> {
    let Some(path) = message.file_response else {
        return Ok(message);
    };
    let id = message.id;

    let bytes = read_and_remove(&path).await?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| BridgeError::Decode(format!("file response {}: {}", path.display(), e)))?;

    let is_envelope = value
        .as_object()
        .is_some_and(|map| map.contains_key("result") || map.contains_key("error"));
    if is_envelope {
        let mut inner = Message::from_value(value);
        inner.id = inner.id.or(id);
        inner.file_response = None;
        Ok(inner)
    } else {
        Ok(Message {
            id,
            result: Some(value),
            ..Message::default()
        })
    }
}

async fn read_and_remove(path: &Path) -> Result<Vec<u8>> {
    let bytes = tokio::fs::read(path).await?;
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "Failed to remove file response");
    }
    Ok(bytes)
}
