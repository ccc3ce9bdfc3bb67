//! In-process transport over paired channels.
//!
//! Useful for wiring sockets within one process, and for tests that should
//! not depend on real networking. Addresses take the form `inproc://name`;
//! the name space is process-wide.

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::OnceLock;
use tokio::sync::mpsc;

use crate::transport::{Acceptor, FrameSink, FrameStream, FramedPair, Transport, TransportError};

/// How many frames each direction of an inproc connection buffers.
const CONNECTION_DEPTH: usize = 128;

/// How many not-yet-accepted connections a bound name holds.
const ACCEPT_BACKLOG: usize = 16;

/// The process-wide rendezvous table from bound name to the acceptor's
/// connection queue.
fn endpoints() -> &'static DashMap<String, mpsc::Sender<FramedPair>> {
    static ENDPOINTS: OnceLock<DashMap<String, mpsc::Sender<FramedPair>>> = OnceLock::new();
    ENDPOINTS.get_or_init(DashMap::new)
}

/// Connects sockets within one process through paired bounded channels.
pub struct InprocTransport;

#[async_trait::async_trait]
impl Transport for InprocTransport {
    fn scheme(&self) -> &'static str {
        "inproc"
    }

    async fn dial(&self, rest: &str) -> Result<FramedPair, TransportError> {
        let Some(conns) = endpoints().get(rest).map(|entry| entry.value().clone()) else {
            return Err(TransportError::Refused(rest.to_string()));
        };
        let (local, remote) = connection();
        conns
            .send(remote)
            .await
            .map_err(|_| TransportError::Refused(rest.to_string()))?;
        Ok(local)
    }

    async fn bind(&self, rest: &str) -> Result<Box<dyn Acceptor>, TransportError> {
        let (conns, accepted) = mpsc::channel(ACCEPT_BACKLOG);
        match endpoints().entry(rest.to_string()) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                // The previous acceptor is gone but its drop has not run yet.
                entry.insert(conns.clone());
            }
            Entry::Occupied(_) => {
                return Err(TransportError::AlreadyBound(rest.to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(conns.clone());
            }
        }
        Ok(Box::new(InprocAcceptor {
            name: rest.to_string(),
            conns,
            accepted,
        }))
    }
}

/// Builds both ends of one bidirectional connection.
fn connection() -> (FramedPair, FramedPair) {
    let (a_to_b, from_a) = mpsc::channel(CONNECTION_DEPTH);
    let (b_to_a, from_b) = mpsc::channel(CONNECTION_DEPTH);
    let a = FramedPair {
        sink: Box::new(InprocFrameSink(a_to_b)),
        stream: Box::new(InprocFrameStream(from_b)),
    };
    let b = FramedPair {
        sink: Box::new(InprocFrameSink(b_to_a)),
        stream: Box::new(InprocFrameStream(from_a)),
    };
    (a, b)
}

struct InprocAcceptor {
    name: String,
    conns: mpsc::Sender<FramedPair>,
    accepted: mpsc::Receiver<FramedPair>,
}

#[async_trait::async_trait]
impl Acceptor for InprocAcceptor {
    async fn accept(&mut self) -> Result<FramedPair, TransportError> {
        self.accepted.recv().await.ok_or(TransportError::PeerClosed)
    }
}

impl Drop for InprocAcceptor {
    fn drop(&mut self) {
        // Unbind only if the table still points at this acceptor; a newer
        // binding for the same name must stay registered.
        endpoints().remove_if(&self.name, |_, conns| conns.same_channel(&self.conns));
    }
}

struct InprocFrameSink(mpsc::Sender<Bytes>);

#[async_trait::async_trait]
impl FrameSink for InprocFrameSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.0
            .send(frame)
            .await
            .map_err(|_| TransportError::PeerClosed)
    }
}

struct InprocFrameStream(mpsc::Receiver<Bytes>);

#[async_trait::async_trait]
impl FrameStream for InprocFrameStream {
    async fn recv(&mut self) -> Result<Option<BytesMut>, TransportError> {
        Ok(self.0.recv().await.map(|frame| BytesMut::from(&frame[..])))
    }
}
