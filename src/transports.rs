//! Built-in transports.

pub mod inproc;
pub mod tcp;

pub use inproc::InprocTransport;
pub use tcp::TcpTransport;
