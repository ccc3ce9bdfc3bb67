//! One established connection to one remote peer.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::id::PipeId;
use crate::shutdown::Shutdown;
use crate::transport::FrameSink;

/// One framed, bidirectional connection owned by a socket.
///
/// A pipe's writes are serialized by a dedicated writer task: callers
/// enqueue encoded frames and the task drains them onto the wire one at a
/// time, so two messages never interleave on one connection. The matching
/// reader task lives in the socket core, which owns the pipe's place in the
/// pipe set.
///
/// A pipe that fails is closed and removed from its socket without
/// disturbing the other pipes; the failure only ever surfaces to the
/// application as that one peer going quiet.
pub struct Pipe {
    id: PipeId,
    addr: String,
    frames: mpsc::Sender<Bytes>,
    stop: Shutdown,
    closed: AtomicBool,
}

impl Pipe {
    /// Creates a pipe around `sink` and spawns its writer task into the
    /// owner's task registry.
    pub(crate) fn start(
        addr: &str,
        mut sink: Box<dyn FrameSink>,
        queue_depth: usize,
        tasks: &mut JoinSet<()>,
    ) -> Arc<Self> {
        let (frames, mut queued) = mpsc::channel(queue_depth);
        let pipe = Arc::new(Self {
            id: PipeId::next(),
            addr: addr.to_string(),
            frames,
            stop: Shutdown::new(),
            closed: AtomicBool::new(false),
        });

        let writer = pipe.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = writer.stop.wait() => break,
                    frame = queued.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                tracing::debug!(id = %writer.id, addr = %writer.addr, error = %e, "pipe write failed");
                                writer.close();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        pipe
    }

    /// This pipe's identity, stable for the connection's lifetime.
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// The address this pipe was established through.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueues one frame for transmission without waiting. Returns `false`
    /// if the frame was not accepted, either because the send queue is full
    /// or because the pipe is closed; the caller must not retry, bus
    /// delivery is best-effort.
    pub(crate) fn try_send(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(id = %self.id, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Tears the connection down. Idempotent; the writer and reader tasks
    /// observe the signal and exit promptly.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!(id = %self.id, addr = %self.addr, "pipe closed");
            self.stop.shut_down();
        }
    }

    /// Waits until the pipe is closed. Returns immediately if it already
    /// was.
    pub(crate) async fn wait_closed(&self) {
        self.stop.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameSink, TransportError};
    use std::sync::Mutex;

    /// Records every frame it is handed.
    struct RecordingSink(Arc<Mutex<Vec<Bytes>>>);

    #[async_trait::async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(frame);
            Ok(())
        }
    }

    /// Fails every write.
    struct BrokenSink;

    #[async_trait::async_trait]
    impl FrameSink for BrokenSink {
        async fn send(&mut self, _frame: Bytes) -> Result<(), TransportError> {
            Err(TransportError::PeerClosed)
        }
    }

    #[tokio::test]
    async fn writer_drains_in_order() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();
        let pipe = Pipe::start(
            "inproc://test",
            Box::new(RecordingSink(written.clone())),
            8,
            &mut tasks,
        );

        assert!(pipe.try_send(Bytes::from_static(b"one")));
        assert!(pipe.try_send(Bytes::from_static(b"two")));
        while written.lock().unwrap().len() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        pipe.close();
        while tasks.join_next().await.is_some() {}

        let written = written.lock().unwrap();
        assert_eq!(&written[..], &[&b"one"[..], &b"two"[..]]);
    }

    #[tokio::test]
    async fn write_failure_closes_pipe() {
        let mut tasks = JoinSet::new();
        let pipe = Pipe::start("inproc://test", Box::new(BrokenSink), 8, &mut tasks);

        assert!(pipe.try_send(Bytes::from_static(b"doomed")));
        pipe.wait_closed().await;
        assert!(pipe.is_closed());
        assert!(!pipe.try_send(Bytes::from_static(b"after")));
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut tasks = JoinSet::new();
        let pipe = Pipe::start("inproc://test", Box::new(BrokenSink), 8, &mut tasks);
        pipe.close();
        pipe.close();
        assert!(pipe.is_closed());
        while tasks.join_next().await.is_some() {}
    }
}
