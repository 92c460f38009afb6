//! Registry of in-flight and queued requests.
//!
//! Every request gets a UUIDv4 id, a single-use completion sink and a
//! deadline timer. Exactly one of {response, rejection, timeout} completes
//! it: the first completion removes the entry, so anything later finds
//! nothing and is a no-op.
//!
//! While the worker is not ready, new requests are parked on a FIFO queue
//! together with their encoded request line. The supervisor drains the queue
//! once the process is running and only then opens the registry for direct
//! dispatch, so queued requests always reach the worker in issue order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};

/// Receiving half of a request's completion sink.
pub type Completion = oneshot::Receiver<Result<Value>>;

/// Who issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Caller command; counts towards the served total.
    Command,
    /// Health probe issued by the monitor.
    Probe,
}

/// What the caller should do with a freshly registered request.
#[derive(Debug)]
pub enum Route {
    /// Worker is ready: write this request line now.
    Dispatch(BytesMut),
    /// Parked until the worker is running.
    Queued,
}

struct PendingRequest {
    command: String,
    kind: RequestKind,
    /// Registration order, used to find the oldest dispatched request.
    seq: u64,
    created_at: Instant,
    sink: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
    /// Encoded request line while queued.
    payload: Option<BytesMut>,
    dispatched: bool,
}

impl PendingRequest {
    fn complete(mut self, outcome: Result<Value>) -> RequestKind {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // Receiver gone means the caller stopped waiting; nothing to do.
        let _ = self.sink.send(outcome);
        self.kind
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, PendingRequest>,
    queue: VecDeque<String>,
    ready: bool,
    next_seq: u64,
}

/// Tracks every request between registration and completion.
#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<Inner>,
}

impl RequestRegistry {
    /// Create an empty, not-ready registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and arm its deadline timer.
    ///
    /// The route decision is taken under the same lock as the insertion, so a
    /// request is either queued before the supervisor's final drain or
    /// dispatched directly after it.
    pub fn register(
        self: &Arc<Self>,
        id: String,
        command: &str,
        kind: RequestKind,
        payload: BytesMut,
        timeout: Duration,
    ) -> (Completion, Route) {
        let (sink, completion) = oneshot::channel();

        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let ready = inner.ready;
        let (route, payload) = if ready {
            (Route::Dispatch(payload), None)
        } else {
            inner.queue.push_back(id.clone());
            (Route::Queued, Some(payload))
        };

        let timer = {
            let registry = Arc::downgrade(self);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(registry) = registry.upgrade() {
                    registry.expire(&id, timeout);
                }
            })
        };

        inner.pending.insert(
            id,
            PendingRequest {
                command: command.to_string(),
                kind,
                seq,
                created_at: Instant::now(),
                sink,
                timer: Some(timer),
                payload,
                dispatched: ready,
            },
        );

        (completion, route)
    }

    /// Complete a request with the worker's outcome.
    ///
    /// Returns the request kind, or `None` if the id is not tracked (already
    /// completed, timed out, or never issued).
    pub fn complete(&self, id: &str, outcome: Result<Value>) -> Option<RequestKind> {
        let entry = self.remove(id)?;
        let elapsed = entry.created_at.elapsed();
        tracing::debug!(
            id,
            command = %entry.command,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = outcome.is_ok(),
            "Request completed"
        );
        Some(entry.complete(outcome))
    }

    /// Resolve a request. Returns `false` if it was already completed.
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value)).is_some()
    }

    /// Reject a request. Returns `false` if it was already completed.
    pub fn reject(&self, id: &str, error: BridgeError) -> bool {
        self.complete(id, Err(error)).is_some()
    }

    fn remove(&self, id: &str) -> Option<PendingRequest> {
        let mut inner = self.lock();
        let entry = inner.pending.remove(id)?;
        if !entry.dispatched {
            inner.queue.retain(|queued| queued != id);
        }
        Some(entry)
    }

    fn expire(&self, id: &str, timeout: Duration) {
        let Some(mut entry) = self.remove(id) else {
            return;
        };
        // This task is the timer; it must not abort itself.
        entry.timer = None;

        tracing::warn!(
            id,
            command = %entry.command,
            timeout_ms = timeout.as_millis() as u64,
            queued = !entry.dispatched,
            "Request timed out"
        );
        let command = entry.command.clone();
        entry.complete(Err(BridgeError::Timeout { command, timeout }));
    }

    /// Reject the oldest dispatched request. Used when a response frame
    /// cannot be decoded and so cannot be attributed to anyone.
    pub fn reject_oldest(&self, error: BridgeError) -> Option<String> {
        let (id, entry) = {
            let mut inner = self.lock();
            let id = inner
                .pending
                .iter()
                .filter(|(_, entry)| entry.dispatched)
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone())?;
            let entry = inner.pending.remove(&id)?;
            (id, entry)
        };

        entry.complete(Err(error));
        Some(id)
    }

    /// Reject every tracked request, queued or dispatched. Returns how many.
    pub fn reject_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.queue.clear();
            inner.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.complete(Err(make_error()));
        }
        count
    }

    /// Reject requests already written to the worker, keeping the queue.
    pub fn reject_dispatched(&self, make_error: impl Fn() -> BridgeError) -> usize {
        self.reject_where(|entry| entry.dispatched, make_error)
    }

    /// Reject queued requests only.
    pub fn reject_queued(&self, make_error: impl Fn() -> BridgeError) -> usize {
        self.reject_where(|entry| !entry.dispatched, make_error)
    }

    fn reject_where(
        &self,
        predicate: impl Fn(&PendingRequest) -> bool,
        make_error: impl Fn() -> BridgeError,
    ) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            let ids: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(id, _)| id.clone())
                .collect();
            let drained: Vec<_> = ids
                .iter()
                .filter_map(|id| inner.pending.remove(id))
                .collect();
            let Inner { pending, queue, .. } = &mut *inner;
            queue.retain(|id| pending.contains_key(id));
            drained
        };
        let count = drained.len();
        for entry in drained {
            entry.complete(Err(make_error()));
        }
        count
    }

    /// Hand out the queued request lines in issue order, marking them
    /// dispatched. When the queue is already empty, open the registry for
    /// direct dispatch instead and return nothing.
    pub fn take_queue_or_open(&self) -> Vec<(String, BytesMut)> {
        let mut inner = self.lock();
        if inner.queue.is_empty() {
            inner.ready = true;
            return Vec::new();
        }

        let Inner { pending, queue, .. } = &mut *inner;
        queue
            .drain(..)
            .filter_map(|id| {
                let entry = pending.get_mut(&id)?;
                entry.dispatched = true;
                let payload = entry.payload.take()?;
                Some((id, payload))
            })
            .collect()
    }

    /// Close the registry: new requests are queued until the next drain.
    pub fn close(&self) {
        self.lock().ready = false;
    }

    /// Whether new requests are dispatched directly.
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Number of tracked requests, queued ones included.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no request is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Number of queued requests.
    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<RequestRegistry> {
        Arc::new(RequestRegistry::new())
    }

    fn line(tag: &str) -> BytesMut {
        BytesMut::from(tag.as_bytes())
    }

    fn register(
        registry: &Arc<RequestRegistry>,
        id: &str,
        timeout: Duration,
    ) -> (Completion, Route) {
        registry.register(
            id.to_string(),
            "echo",
            RequestKind::Command,
            line(id),
            timeout,
        )
    }

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_queued_until_opened() {
        let registry = registry();
        let (_rx, route) = register(&registry, "a", LONG);
        assert!(matches!(route, Route::Queued));
        assert_eq!(registry.queued_len(), 1);

        let drained = registry.take_queue_or_open();
        assert_eq!(drained.len(), 1);
        assert_eq!(&drained[0].1[..], b"a");
        assert!(!registry.is_ready());

        assert!(registry.take_queue_or_open().is_empty());
        assert!(registry.is_ready());

        let (_rx, route) = register(&registry, "b", LONG);
        assert!(matches!(route, Route::Dispatch(ref p) if &p[..] == b"b"));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_drains_in_issue_order() {
        let registry = registry();
        let ids = ["first", "second", "third"];
        let _rxs: Vec<_> = ids.iter().map(|id| register(&registry, id, LONG)).collect();

        let drained: Vec<String> = registry
            .take_queue_or_open()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(drained, ids);
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let registry = registry();
        let (rx, _) = register(&registry, "a", LONG);

        assert!(registry.resolve("a", json!({"echo": true})));
        assert!(!registry.resolve("a", json!(2)));
        assert!(!registry.reject("a", BridgeError::NotRunning));

        assert_eq!(rx.await.unwrap().unwrap(), json!({"echo": true}));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_later_response_is_orphan() {
        let registry = registry();
        let started = Instant::now();
        let (rx, _) = register(&registry, "slow", Duration::from_millis(50));

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(registry.is_empty());

        assert!(registry.complete("slow", Ok(json!(1))).is_none());
    }

    #[tokio::test]
    async fn test_timeout_removes_queued_entry() {
        let registry = registry();
        let (rx, _) = register(&registry, "a", Duration::from_millis(10));
        assert!(rx.await.unwrap().unwrap_err().is_timeout());
        assert_eq!(registry.queued_len(), 0);
        assert!(registry.take_queue_or_open().is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_are_independent() {
        let registry = registry();
        registry.take_queue_or_open();

        let (fast, _) = register(&registry, "fast", Duration::from_millis(20));
        let (slow, _) = register(&registry, "slow", LONG);

        assert!(fast.await.unwrap().unwrap_err().is_timeout());
        assert_eq!(registry.len(), 1);

        registry.resolve("slow", json!("done"));
        assert_eq!(slow.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let registry = registry();
        let rxs: Vec<_> = (0..3)
            .map(|i| register(&registry, &format!("q{}", i), LONG).0)
            .collect();
        registry.take_queue_or_open();
        let (late, _) = register(&registry, "late", LONG);

        let count = registry.reject_all(|| BridgeError::ProcessTerminated("gone".into()));
        assert_eq!(count, 4);

        for rx in rxs {
            assert!(rx.await.unwrap().unwrap_err().is_terminated());
        }
        // "late" was still queued and is rejected too.
        assert!(late.await.unwrap().unwrap_err().is_terminated());
        assert!(registry.is_empty());
        assert_eq!(registry.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_reject_dispatched_keeps_queue() {
        let registry = registry();
        registry.take_queue_or_open();
        let (inflight, _) = register(&registry, "inflight", LONG);

        registry.close();
        let (_queued, route) = register(&registry, "queued", LONG);
        assert!(matches!(route, Route::Queued));

        let count = registry.reject_dispatched(|| BridgeError::ProcessTerminated("restart".into()));
        assert_eq!(count, 1);
        assert!(inflight.await.unwrap().unwrap_err().is_terminated());

        assert_eq!(registry.queued_len(), 1);
        let drained = registry.take_queue_or_open();
        assert_eq!(drained[0].0, "queued");
    }

    #[tokio::test]
    async fn test_reject_oldest_dispatched() {
        let registry = registry();
        registry.take_queue_or_open();
        let (first, _) = register(&registry, "first", LONG);
        let (second, _) = register(&registry, "second", LONG);

        let rejected = registry.reject_oldest(BridgeError::Decode("bad frame".into()));
        assert_eq!(rejected.as_deref(), Some("first"));
        assert!(matches!(
            first.await.unwrap(),
            Err(BridgeError::Decode(_))
        ));

        registry.resolve("second", json!(2));
        assert_eq!(second.await.unwrap().unwrap(), json!(2));
        assert!(registry.reject_oldest(BridgeError::Decode("x".into())).is_none());
    }

    #[tokio::test]
    async fn test_reject_oldest_ignores_queued() {
        let registry = registry();
        let (_queued, _) = register(&registry, "queued", LONG);
        assert!(registry.reject_oldest(BridgeError::Decode("x".into())).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_completion_reports_kind() {
        let registry = registry();
        registry.take_queue_or_open();
        let (_rx, _) = registry.register(
            "probe".into(),
            "check_memory",
            RequestKind::Probe,
            line("p"),
            LONG,
        );
        assert_eq!(
            registry.complete("probe", Ok(Value::Null)),
            Some(RequestKind::Probe)
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_harmless() {
        let registry = registry();
        let (rx, _) = register(&registry, "a", LONG);
        drop(rx);
        assert!(registry.resolve("a", json!(1)));
    }
}
