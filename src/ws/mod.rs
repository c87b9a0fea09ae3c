//! WebSocket transport for movement commands

pub mod handler;
pub mod protocol;
