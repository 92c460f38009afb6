//! Dedicated writer task for the worker's stdin.
//!
//! Callers never touch the pipe directly. Request lines go through an mpsc
//! channel to a single task that owns the write half, so concurrent senders
//! need no lock and lines are never interleaved.
//!
//! # Architecture
//!
//! ```text
//! send_command 1 ─┐
//! send_command 2 ─┼─► mpsc::Sender<OutboundRequest> ─► Writer Task ─► worker stdin
//! queue drain    ─┘
//! ```
//!
//! Ready lines are batched into a single `write_vectored` call. After a
//! batch is written its buffers go back to the [`BufferPool`]. If a write
//! fails, every request in the batch is rejected with the I/O error, lines
//! still waiting in the channel are rejected as terminated, and the task
//! exits with the error; later sends fail because the channel is closed.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::protocol::BufferPool;
use crate::registry::RequestRegistry;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum request lines to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A request line ready to be written to the worker.
#[derive(Debug)]
pub struct OutboundRequest {
    /// Request id to reject if the write fails. `None` for control lines
    /// such as the exit command.
    pub id: Option<String>,
    /// Encoded line, `\n` included.
    pub payload: BytesMut,
}

impl OutboundRequest {
    /// A tracked request line.
    pub fn new(id: String, payload: BytesMut) -> Self {
        Self {
            id: Some(id),
            payload,
        }
    }

    /// An untracked control line.
    pub fn control(payload: BytesMut) -> Self {
        Self { id: None, payload }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the line queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending request lines to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundRequest>,
    /// Lines accepted but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue a line for writing.
    ///
    /// Waits if the channel is full. Fails with `NotRunning` once the writer
    /// task has exited.
    pub async fn send(&self, request: OutboundRequest) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(request).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            BridgeError::NotRunning
        })
    }

    /// Lines accepted but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending lines.
///
/// The returned `JoinHandle` completes when every handle is dropped (clean
/// shutdown) or after the first failed write.
pub fn spawn_writer_task<W>(
    writer: W,
    registry: Arc<RequestRegistry>,
    pool: Arc<BufferPool>,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };

    let task = tokio::spawn(writer_loop(rx, writer, registry, pool, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundRequest>,
    mut writer: W,
    registry: Arc<RequestRegistry>,
    pool: Arc<BufferPool>,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(r) => r,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let outcome = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = outcome {
            tracing::error!(error = %e, batch_size, "Failed to write to worker stdin");
            for request in &batch {
                if let Some(id) = &request.id {
                    let err = std::io::Error::new(e.kind(), e.to_string());
                    registry.reject(id, BridgeError::Io(err));
                }
            }

            // Lines accepted after the failed batch would otherwise never
            // settle; nothing is written past a broken pipe.
            rx.close();
            let mut abandoned = 0;
            while let Ok(request) = rx.try_recv() {
                pending.fetch_sub(1, Ordering::Release);
                abandoned += 1;
                if let Some(id) = &request.id {
                    registry.reject(
                        id,
                        BridgeError::ProcessTerminated("worker stdin closed".to_string()),
                    );
                }
            }
            if abandoned > 0 {
                tracing::warn!(abandoned, "Rejected queued lines after stdin failure");
            }
            return Err(BridgeError::Io(e));
        }

        for request in batch {
            pool.release_buffer(request.payload);
        }
    }
}

/// Write a batch of lines using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundRequest]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|r| r.payload.len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundRequest], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for request in batch {
        let start = offset;
        let end = offset + request.payload.len();
        offset = end;

        if skip_bytes < end && start < end {
            let start_in_payload = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&request.payload[start_in_payload..]));
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RequestKind, Route};
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn line(text: &str) -> BytesMut {
        BytesMut::from(text.as_bytes())
    }

    fn spawn_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        spawn_writer_task(
            writer,
            Arc::new(RequestRegistry::new()),
            Arc::new(BufferPool::new(2, 64)),
            WriterConfig::default(),
        )
    }

    /// Writer whose writes always fail.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_default(client);

        handle
            .send(OutboundRequest::new("a".into(), line("{\"id\":\"a\"}\n")))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"id\":\"a\"}\n");
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_default(client);

        let mut expected = Vec::new();
        for i in 0..100 {
            let text = format!("{{\"id\":\"{}\"}}\n", i);
            expected.extend_from_slice(text.as_bytes());
            handle
                .send(OutboundRequest::new(i.to_string(), line(&text)))
                .await
                .unwrap();
        }
        drop(handle);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_written_buffers_return_to_pool() {
        let (client, mut server) = duplex(4096);
        let pool = Arc::new(BufferPool::new(2, 64));
        let (handle, _task) = spawn_writer_task(
            client,
            Arc::new(RequestRegistry::new()),
            pool.clone(),
            WriterConfig::default(),
        );

        let mut payload = pool.get_buffer();
        payload.extend_from_slice(b"line\n");
        handle
            .send(OutboundRequest::new("a".into(), payload))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"line\n");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 1);
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_rejects_batch() {
        let registry = Arc::new(RequestRegistry::new());
        registry.take_queue_or_open();

        let (rx, route) = registry.register(
            "a".into(),
            "echo",
            RequestKind::Command,
            line("{\"id\":\"a\"}\n"),
            Duration::from_secs(30),
        );
        let Route::Dispatch(payload) = route else {
            panic!("registry should be open");
        };

        let (handle, task) = spawn_writer_task(
            BrokenPipe,
            registry.clone(),
            Arc::new(BufferPool::new(1, 64)),
            WriterConfig::default(),
        );
        handle
            .send(OutboundRequest::new("a".into(), payload))
            .await
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(registry.is_empty());

        assert!(task.await.unwrap().is_err());
        let err = handle
            .send(OutboundRequest::control(line("x\n")))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_write_failure_rejects_lines_left_in_channel() {
        let registry = Arc::new(RequestRegistry::new());
        registry.take_queue_or_open();

        let (handle, task) = spawn_writer_task(
            BrokenPipe,
            registry.clone(),
            Arc::new(BufferPool::new(1, 64)),
            WriterConfig::default(),
        );

        // More lines than one batch.
        let mut completions = Vec::new();
        for i in 0..(MAX_BATCH_SIZE * 2 + 5) {
            let id = format!("r{}", i);
            let (rx, route) = registry.register(
                id.clone(),
                "echo",
                RequestKind::Command,
                line("{}\n"),
                Duration::from_secs(30),
            );
            let Route::Dispatch(payload) = route else {
                panic!("registry should be open");
            };
            // The task may already have failed; callers reject on refusal.
            if let Err(e) = handle.send(OutboundRequest::new(id.clone(), payload)).await {
                registry.reject(&id, e);
            }
            completions.push(rx);
        }

        assert!(task.await.unwrap().is_err());
        for rx in completions {
            let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
                .await
                .expect("request left hanging after stdin failure")
                .unwrap();
            let err = outcome.unwrap_err();
            assert!(matches!(
                err,
                BridgeError::Io(_) | BridgeError::ProcessTerminated(_) | BridgeError::NotRunning
            ));
        }
        assert!(registry.is_empty());
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![
            OutboundRequest::new("a".into(), line("hello\n")),
            OutboundRequest::control(line("bye\n")),
        ];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial() {
        let batch = vec![
            OutboundRequest::new("a".into(), line("hello\n")),
            OutboundRequest::new("b".into(), line("world\n")),
        ];

        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"o\n");
        assert_eq!(slices[1].len(), 6);

        let slices = build_remaining_slices(&batch, 6);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"world\n");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (0..5)
            .map(|i| OutboundRequest::new(i.to_string(), line("abc\n")))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner(), b"abc\n".repeat(5));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
