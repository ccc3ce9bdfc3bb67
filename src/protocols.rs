//! Distribution policies that can be bound to a socket.

pub mod bus;
pub use bus::Bus;
