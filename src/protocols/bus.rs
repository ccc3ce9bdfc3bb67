//! The bus distribution policy.

use crate::message::Message;
use crate::protocol::Protocol;
use crate::socket::{PipeSet, SocketError};
use crate::PipeId;

/// Broadcast with echo-free relay.
///
/// Sending transmits the message to every live pipe. A message arriving on
/// pipe `P` is relayed to every live pipe except `P` and then delivered to
/// the local application, so a node with several pipes acts as a forwarding
/// hub. One listener with many dialers therefore behaves as a full broadcast
/// bus even though the dialers never connect to each other.
///
/// Delivery is best-effort: a peer whose send queue is full or whose
/// connection has broken misses that message, and sending with no pipes at
/// all quietly succeeds. Topologies containing cycles (for example two hubs
/// cross-connected) are not supported; there is no hop bound or duplicate
/// suppression, so a cycle would circulate messages forever. Star and tree
/// shapes are the supported arrangements.
pub struct Bus;

impl Bus {
    /// The protocol identifier, as given to [`Socket::new`](crate::Socket::new).
    pub const NAME: &'static str = "bus";

    pub fn new() -> Self {
        Self
    }

    /// Transmits one encoded frame to every pipe except `exclude`.
    fn broadcast(pipes: &PipeSet, message: &Message, exclude: Option<PipeId>) {
        let frame = message.to_bytes();
        for pipe in pipes.snapshot() {
            if Some(pipe.id()) == exclude {
                continue;
            }
            if !pipe.try_send(frame.clone()) {
                tracing::trace!(id = %pipe.id(), "peer missed a frame");
            }
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Protocol for Bus {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn send_policy(&self, pipes: &PipeSet, message: Message) -> Result<(), SocketError> {
        Self::broadcast(pipes, &message, None);
        message.free();
        Ok(())
    }

    async fn receive(&self, pipes: &PipeSet, source: PipeId, message: Message) -> Option<Message> {
        // Relay before local delivery so a slow application does not hold up
        // the rest of the bus.
        Self::broadcast(pipes, &message, Some(source));
        Some(message)
    }
}
