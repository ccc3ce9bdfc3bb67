//! A messaging socket library implementing the bus scalability protocol.
//!
//! A [`Socket`] multiplexes any number of peer connections ("pipes") behind a
//! single logical endpoint. The socket may listen for inbound connections,
//! dial out to remote peers, or both at once, and every established
//! connection joins the same pipe set. The distribution policy bound to the
//! socket decides how sent messages spread across that set and how arriving
//! messages are handled.
//!
//! The one policy shipped here is the [`Bus`](protocols::Bus): every message
//! a node sends reaches every other node reachable through the connection
//! graph, exactly once, and never echoes back to its originator. Nodes with
//! more than one pipe relay inbound traffic onward, so a single listener with
//! many dialers behaves as a full broadcast bus without requiring a full
//! mesh.
//!
//! # Organization
//!
//! - [`Message`] is the pooled unit of payload handed across the API.
//! - [`Socket`] owns the pipe set, the listeners and dialers that grow it,
//!   and the blocking send/receive surface.
//! - [`Protocol`] is the seam between the socket core and a distribution
//!   policy; [`ProtocolRegistry`] maps protocol names to constructors.
//! - [`transport`] holds the byte-stream boundary: framed connections are
//!   supplied by a [`Transport`](transport::Transport) selected by address
//!   scheme (`tcp://...`, `inproc://...`).
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), trellis::SocketError> {
//! use trellis::{Message, Socket};
//!
//! let hub = Socket::new("bus")?;
//! hub.listen("tcp://127.0.0.1:5700").await?;
//!
//! let node = Socket::new("bus")?;
//! node.dial("tcp://127.0.0.1:5700").await?;
//!
//! node.send(Message::from(&b"hello"[..])).await?;
//! let reply = hub.recv().await?;
//! reply.free();
//! # Ok(())
//! # }
//! ```

pub mod message;
pub use message::{AllocError, Message};

mod id;
pub use id::PipeId;

mod shutdown;
pub use shutdown::Shutdown;

pub mod protocol;
pub use protocol::{Protocol, ProtocolRegistry, SharedProtocol};

pub mod protocols;

pub mod pipe;
pub use pipe::Pipe;

pub mod socket;
pub use socket::{PipeSet, Socket, SocketError, SocketOptions};

pub mod transport;
pub mod transports;
