//! WebSocket wire protocol: command grammar, acknowledgments, framing

pub mod messages;
pub mod server;

pub use messages::Command;
pub use server::{ServerError, VisServer};
