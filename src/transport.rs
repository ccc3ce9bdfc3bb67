//! The byte-stream boundary: traits a transport implements to supply framed
//! connections, plus address parsing and the scheme registry.
//!
//! The socket core never touches raw sockets or framing itself. It asks a
//! [`Transport`] for connections, each delivered as a [`FramedPair`] that
//! moves whole frames in both directions. The wire format of a frame on an
//! established connection is the transport's business; the TCP transport
//! uses a length prefix, the in-process transport has no wire at all.

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::transports::{InprocTransport, TcpTransport};

/// Writes whole frames to one connection. Calls must be serialized by the
/// owner; the socket core dedicates one writer task per pipe for this.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    /// Writes one frame, blocking until the transport accepts it.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
}

/// Reads whole frames from one connection.
#[async_trait::async_trait]
pub trait FrameStream: Send {
    /// Blocks until one complete frame arrives. Returns `None` when the peer
    /// shuts the connection down cleanly.
    async fn recv(&mut self) -> Result<Option<BytesMut>, TransportError>;
}

/// Both directions of one established, framed connection.
pub struct FramedPair {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Produces connections for one address scheme.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The scheme this transport serves, e.g. `"tcp"`.
    fn scheme(&self) -> &'static str;

    /// Establishes one outbound connection to `rest` (the address with the
    /// scheme stripped).
    async fn dial(&self, rest: &str) -> Result<FramedPair, TransportError>;

    /// Binds to `rest` and returns an acceptor for inbound connections.
    async fn bind(&self, rest: &str) -> Result<Box<dyn Acceptor>, TransportError>;
}

/// Accepts inbound connections for one bound address. Dropping the acceptor
/// releases the binding.
#[async_trait::async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<FramedPair, TransportError>;
}

/// A connection-level or binding-level transport failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed address: {0}")]
    BadAddress(String),
    #[error("address already in use: {0}")]
    AlreadyBound(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits a scheme-qualified address like `tcp://127.0.0.1:5700` into its
/// scheme and remainder.
pub fn parse_scheme(addr: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = addr.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    Some((scheme, rest))
}

/// Maps address schemes to transports.
///
/// The default registry carries the built-in `tcp` and `inproc` transports;
/// sockets resolve every `listen`/`dial` address against their registry.
#[derive(Clone)]
pub struct TransportRegistry {
    transports: FxHashMap<&'static str, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            transports: FxHashMap::default(),
        }
    }

    /// Adds a transport, replacing any previous one for the same scheme.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.scheme(), transport);
    }

    /// Looks up the transport for a scheme.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(scheme).cloned()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpTransport));
        registry.register(Arc::new(InprocTransport));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_parsing() {
        assert_eq!(
            parse_scheme("tcp://127.0.0.1:5700"),
            Some(("tcp", "127.0.0.1:5700"))
        );
        assert_eq!(parse_scheme("inproc://name"), Some(("inproc", "name")));
        assert_eq!(parse_scheme("127.0.0.1:5700"), None);
        assert_eq!(parse_scheme("tcp://"), None);
        assert_eq!(parse_scheme("://addr"), None);
    }

    #[test]
    fn default_registry_schemes() {
        let registry = TransportRegistry::default();
        assert!(registry.get("tcp").is_some());
        assert!(registry.get("inproc").is_some());
        assert!(registry.get("carrier-pigeon").is_none());
    }
}
