//! The [`Socket`] core: pipe-set bookkeeping, listen/dial lifecycle, the
//! blocking send/receive surface, and close semantics. Everything here is
//! protocol-agnostic; the bound [`Protocol`] supplies the distribution
//! policy.

use dashmap::DashMap;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::message::{AllocError, Message};
use crate::pipe::Pipe;
use crate::protocol::{ProtocolRegistry, SharedProtocol};
use crate::shutdown::Shutdown;
use crate::transport::{
    parse_scheme, FrameStream, FramedPair, Transport, TransportError, TransportRegistry,
};
use crate::PipeId;

/// How long a listener backs off after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tunables fixed at socket construction.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Frames a single pipe queues before further broadcasts drop its copy.
    pub send_queue_depth: usize,
    /// Messages buffered for the application before pipe readers block.
    pub recv_queue_depth: usize,
    /// First dialer retry delay; doubles on each consecutive failure.
    pub reconnect_initial: Duration,
    /// Ceiling for the dialer retry delay.
    pub reconnect_max: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_queue_depth: 128,
            recv_queue_depth: 128,
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(8),
        }
    }
}

/// An error from a socket operation.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("invalid address: {0}")]
    BadAddress(String),
    #[error("socket is closed")]
    Closed,
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The set of currently live pipes owned by one socket.
///
/// Membership changes concurrently with traffic: listeners and dialers add
/// pipes as connections land, readers remove them as connections break.
/// [`snapshot`](PipeSet::snapshot) gives broadcast loops a stable view, so a
/// pipe torn down mid-broadcast merely discards the frames enqueued to it;
/// its writer task has already stopped touching the wire.
pub struct PipeSet(DashMap<PipeId, Arc<Pipe>>);

impl PipeSet {
    fn new() -> Self {
        Self(DashMap::new())
    }

    /// The number of live pipes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live pipes at one moment. Pipes added afterwards may or may not
    /// see a broadcast iterating this snapshot.
    pub fn snapshot(&self) -> Vec<Arc<Pipe>> {
        self.0.iter().map(|entry| entry.value().clone()).collect()
    }

    fn insert(&self, pipe: Arc<Pipe>) {
        self.0.insert(pipe.id(), pipe);
    }

    fn remove(&self, id: PipeId) -> Option<Arc<Pipe>> {
        self.0.remove(&id).map(|(_, pipe)| pipe)
    }

    fn clear(&self) {
        self.0.clear();
    }
}

/// A messaging socket: one logical endpoint over any number of peer
/// connections.
///
/// A socket may listen, dial, or both, any number of times; every
/// established connection becomes a pipe in the same set, and the bound
/// protocol's policy decides how traffic spreads across them. All methods
/// take `&self` and are safe to call concurrently from any number of tasks;
/// share the socket behind an [`Arc`] to do so.
///
/// Closing the socket tears down every pipe, listener, and dialer, and every
/// operation blocked at that moment returns [`SocketError::Closed`].
/// Dropping an unclosed socket begins the same teardown without waiting for
/// it to finish.
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    protocol: SharedProtocol,
    options: SocketOptions,
    pipes: PipeSet,
    transports: TransportRegistry,
    shutdown: Shutdown,
    torn_down: Shutdown,
    closed: AtomicBool,
    deliveries: mpsc::Sender<Message>,
    inbox: Mutex<mpsc::Receiver<Message>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Socket {
    /// Creates a socket bound to the named protocol from the default
    /// registry, with default options.
    pub fn new(protocol_name: &str) -> Result<Self, SocketError> {
        Self::with_options(protocol_name, SocketOptions::default())
    }

    /// Creates a socket with explicit options.
    pub fn with_options(protocol_name: &str, options: SocketOptions) -> Result<Self, SocketError> {
        Self::with_registry(&ProtocolRegistry::default(), protocol_name, options)
    }

    /// Creates a socket resolving the protocol name against a caller-built
    /// registry.
    pub fn with_registry(
        registry: &ProtocolRegistry,
        protocol_name: &str,
        options: SocketOptions,
    ) -> Result<Self, SocketError> {
        let protocol = registry
            .build(protocol_name)
            .ok_or_else(|| SocketError::UnknownProtocol(protocol_name.to_string()))?;
        let (deliveries, inbox) = mpsc::channel(options.recv_queue_depth);
        Ok(Self {
            inner: Arc::new(SocketInner {
                protocol,
                options,
                pipes: PipeSet::new(),
                transports: TransportRegistry::default(),
                shutdown: Shutdown::new(),
                torn_down: Shutdown::new(),
                closed: AtomicBool::new(false),
                deliveries,
                inbox: Mutex::new(inbox),
                tasks: Mutex::new(JoinSet::new()),
            }),
        })
    }

    /// The name of the bound protocol.
    pub fn protocol_name(&self) -> &'static str {
        self.inner.protocol.name()
    }

    /// The live pipe set.
    pub fn pipes(&self) -> &PipeSet {
        &self.inner.pipes
    }

    /// Starts a listener on `addr`. Returns once the address is bound and
    /// the listener is accepting; each accepted connection becomes a pipe.
    /// A socket may listen on any number of distinct addresses.
    pub async fn listen(&self, addr: &str) -> Result<(), SocketError> {
        self.ensure_open()?;
        let (transport, rest) = self.resolve(addr)?;
        let mut acceptor = transport.bind(rest).await?;
        tracing::debug!(addr, "listener bound");

        let inner = self.inner.clone();
        let addr = addr.to_string();
        self.inner
            .spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.shutdown.wait() => break,
                        accepted = acceptor.accept() => match accepted {
                            Ok(pair) => {
                                if inner.clone().add_pipe(pair, &addr).await.is_none() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(addr = %addr, error = %e, "accept failed");
                                tokio::select! {
                                    _ = inner.shutdown.wait() => break,
                                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                                }
                            }
                        }
                    }
                }
                tracing::debug!(addr = %addr, "listener stopped");
            })
            .await;
        Ok(())
    }

    /// Starts a dialer for `addr`. Returns once the first connection attempt
    /// has been issued; establishment, and reconnection whenever the
    /// connection drops, proceed in the background with exponential backoff.
    pub async fn dial(&self, addr: &str) -> Result<(), SocketError> {
        self.ensure_open()?;
        let (transport, rest) = self.resolve(addr)?;

        let inner = self.inner.clone();
        let addr = addr.to_string();
        let rest = rest.to_string();
        self.inner
            .spawn(async move {
                inner.dial_loop(transport, &addr, &rest).await;
            })
            .await;
        Ok(())
    }

    /// Hands one message to the bound protocol's send policy. Blocks only
    /// while enqueueing; individual peers' write completion is never waited
    /// on, and an individual peer's failure is never surfaced here.
    pub async fn send(&self, message: Message) -> Result<(), SocketError> {
        self.ensure_open()?;
        self.inner
            .protocol
            .send_policy(&self.inner.pipes, message)
            .await
    }

    /// Blocks until a pipe delivers a message for the application, or the
    /// socket closes. Messages from one pipe arrive in the order that pipe
    /// received them; no order is promised across pipes.
    pub async fn recv(&self) -> Result<Message, SocketError> {
        self.ensure_open()?;
        let mut inbox = self.inner.inbox.lock().await;
        tokio::select! {
            _ = self.inner.shutdown.wait() => Err(SocketError::Closed),
            message = inbox.recv() => message.ok_or(SocketError::Closed),
        }
    }

    /// Closes the socket: stops every listener and dialer, closes every
    /// pipe, unblocks all pending operations with [`SocketError::Closed`],
    /// and joins the background tasks. Idempotent and safe to call
    /// concurrently with any in-flight operation; every caller, not just the
    /// first, returns only once teardown has finished.
    pub async fn close(&self) {
        if self.inner.begin_close() {
            let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
            while tasks.join_next().await.is_some() {}
            self.inner.torn_down.shut_down();
            tracing::debug!(protocol = self.protocol_name(), "socket closed");
        } else {
            self.inner.torn_down.wait().await;
        }
    }

    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(SocketError::Closed)
        } else {
            Ok(())
        }
    }

    fn resolve<'a>(&self, addr: &'a str) -> Result<(Arc<dyn Transport>, &'a str), SocketError> {
        let (scheme, rest) =
            parse_scheme(addr).ok_or_else(|| SocketError::BadAddress(addr.to_string()))?;
        let transport = self
            .inner
            .transports
            .get(scheme)
            .ok_or_else(|| SocketError::BadAddress(addr.to_string()))?;
        Ok((transport, rest))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Background tasks observe the shutdown signal and exit on their
        // own; close() is the way to wait for them.
        self.inner.begin_close();
    }
}

impl SocketInner {
    /// Registers a background task so close can join it.
    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.spawn(task);
    }

    /// Flags the socket closed and starts teardown. Returns false if it was
    /// already closed.
    fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!(protocol = self.protocol.name(), "socket closing");
        self.shutdown.shut_down();
        for pipe in self.pipes.snapshot() {
            pipe.close();
        }
        self.pipes.clear();
        true
    }

    /// Adopts one established connection: spawns its writer, adds it to the
    /// pipe set, and spawns its reader. Returns `None` when the socket has
    /// closed, in which case the connection is discarded.
    async fn add_pipe(self: Arc<Self>, pair: FramedPair, addr: &str) -> Option<Arc<Pipe>> {
        let mut tasks = self.tasks.lock().await;
        // Checked under the tasks lock: close flags the socket closed before
        // taking the registry, so an open socket here means the tasks spawned
        // below land in the registry close will join.
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let pipe = Pipe::start(addr, pair.sink, self.options.send_queue_depth, &mut tasks);
        self.pipes.insert(pipe.clone());
        if self.closed.load(Ordering::SeqCst) {
            // Lost the race with close; undo.
            self.detach(&pipe);
            return None;
        }

        let inner = self.clone();
        let reader = pipe.clone();
        let stream = pair.stream;
        tasks.spawn(async move {
            inner.read_loop(reader, stream).await;
        });
        tracing::debug!(id = %pipe.id(), addr, pipes = self.pipes.len(), "pipe attached");
        Some(pipe)
    }

    /// Drives one pipe's inbound side: blocks on the frame stream, runs each
    /// arrival through the protocol's receive policy, and queues deliveries
    /// for the application. Exits when the pipe or the socket closes, or the
    /// connection breaks, and removes the pipe from the set on the way out.
    async fn read_loop(self: Arc<Self>, pipe: Arc<Pipe>, mut stream: Box<dyn FrameStream>) {
        loop {
            tokio::select! {
                _ = pipe.wait_closed() => break,
                frame = stream.recv() => match frame {
                    Ok(Some(frame)) => {
                        let message = Message::from(&frame[..]);
                        let delivery = self
                            .protocol
                            .receive(&self.pipes, pipe.id(), message)
                            .await;
                        if let Some(delivery) = delivery {
                            tokio::select! {
                                _ = self.shutdown.wait() => break,
                                sent = self.deliveries.send(delivery) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(id = %pipe.id(), "peer disconnected");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(id = %pipe.id(), error = %e, "pipe read failed");
                        break;
                    }
                }
            }
        }
        self.detach(&pipe);
    }

    fn detach(&self, pipe: &Pipe) {
        self.pipes.remove(pipe.id());
        pipe.close();
        tracing::debug!(id = %pipe.id(), addr = %pipe.addr(), "pipe detached");
    }

    /// Keeps one outbound connection alive: dials, adopts the connection,
    /// and redials with jittered exponential backoff whenever the attempt
    /// fails or an established connection drops.
    async fn dial_loop(self: Arc<Self>, transport: Arc<dyn Transport>, addr: &str, rest: &str) {
        let mut rng = SmallRng::from_entropy();
        let mut delay = self.options.reconnect_initial;
        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.wait() => return,
                attempt = transport.dial(rest) => attempt,
            };
            match attempt {
                Ok(pair) => {
                    tracing::debug!(addr = %addr, "dialer connected");
                    delay = self.options.reconnect_initial;
                    let Some(pipe) = self.clone().add_pipe(pair, addr).await else {
                        return;
                    };
                    tokio::select! {
                        _ = self.shutdown.wait() => return,
                        _ = pipe.wait_closed() => {
                            tracing::debug!(addr = %addr, "connection lost, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "dial attempt failed");
                }
            }

            let jitter = Duration::from_millis(rng.gen_range(0..=delay.as_millis() as u64 / 4));
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(delay + jitter) => {}
            }
            delay = (delay * 2).min(self.options.reconnect_max);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("protocol", &self.protocol_name())
            .field("pipes", &self.inner.pipes.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_is_rejected() {
        match Socket::new("pair") {
            Err(SocketError::UnknownProtocol(name)) => assert_eq!(name, "pair"),
            other => panic!("expected UnknownProtocol, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_with_no_pipes_succeeds() {
        let socket = Socket::new("bus").unwrap();
        socket.send(Message::from(&b"nobody listening"[..])).await.unwrap();
        assert!(socket.pipes().is_empty());
        socket.close().await;
    }

    #[tokio::test]
    async fn malformed_addresses_are_rejected() {
        let socket = Socket::new("bus").unwrap();
        assert!(matches!(
            socket.listen("127.0.0.1:5700").await,
            Err(SocketError::BadAddress(_))
        ));
        assert!(matches!(
            socket.dial("carrier-pigeon://coop").await,
            Err(SocketError::BadAddress(_))
        ));
        socket.close().await;
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let socket = Socket::new("bus").unwrap();
        socket.close().await;
        assert!(matches!(socket.recv().await, Err(SocketError::Closed)));
        assert!(matches!(
            socket.send(Message::new(0)).await,
            Err(SocketError::Closed)
        ));
        assert!(matches!(
            socket.listen("inproc://late").await,
            Err(SocketError::Closed)
        ));
        assert!(matches!(
            socket.dial("inproc://late").await,
            Err(SocketError::Closed)
        ));
        // Close twice is fine.
        socket.close().await;
    }
}
