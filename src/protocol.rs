//! The [`Protocol`] trait and the registry that maps protocol names to
//! constructors.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::message::Message;
use crate::protocols::Bus;
use crate::socket::{PipeSet, SocketError};
use crate::PipeId;

/// A shared handle to a [`Protocol`].
pub type SharedProtocol = Arc<dyn Protocol>;

/// A distribution policy plugged into the socket core.
///
/// The socket core owns the pipe set and the blocking send/receive surface;
/// the protocol decides which pipes an outbound message reaches and what
/// happens when a message arrives on a pipe. Policies keep no per-connection
/// state of their own beyond what the pipe set carries, which is what lets
/// one socket core serve every scalability pattern.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// The name this protocol registers under, e.g. `"bus"`.
    fn name(&self) -> &'static str;

    /// Distributes one outbound message across the pipe set. Called by
    /// [`Socket::send`](crate::Socket::send); takes ownership of the
    /// message.
    ///
    /// Implementations must not block on any individual peer's write
    /// completing; a slow peer is that peer's problem.
    async fn send_policy(&self, pipes: &PipeSet, message: Message) -> Result<(), SocketError>;

    /// Reacts to a message arriving on `source`. Returns the message if it
    /// should be delivered to the local application, or `None` to consume it
    /// within the protocol.
    async fn receive(&self, pipes: &PipeSet, source: PipeId, message: Message) -> Option<Message>;
}

type ProtocolConstructor = fn() -> SharedProtocol;

/// An explicit table of known protocols, keyed by name.
///
/// [`Socket::new`](crate::Socket::new) resolves its protocol name against
/// the default registry; [`Socket::with_registry`](crate::Socket::with_registry)
/// accepts a custom table for applications that bring their own policies.
#[derive(Clone)]
pub struct ProtocolRegistry {
    constructors: FxHashMap<&'static str, ProtocolConstructor>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: FxHashMap::default(),
        }
    }

    /// Adds a constructor under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &'static str, constructor: ProtocolConstructor) {
        self.constructors.insert(name, constructor);
    }

    /// Instantiates the protocol registered under `name`.
    pub fn build(&self, name: &str) -> Option<SharedProtocol> {
        self.constructors.get(name).map(|constructor| constructor())
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Bus::NAME, || Arc::new(Bus::new()));
        registry
    }
}
