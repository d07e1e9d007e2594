//! Peer synchronization: wire format, message handling and the TCP server

pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::{Outbound, ProtocolHandler};
pub use protocol::{Command, InventoryKind, Message};
pub use server::{dispatch, send_message, Server};
