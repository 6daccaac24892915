//! WebSocket Session Management
//!
//! Each connection owns one conversation. It is structured into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-host communication.
//! - `session`: Manages the connection lifecycle, from handshake to termination.
//! - `sink`: Relays avatar playback commands to the client.

pub mod protocol;
pub mod session;
mod sink;

pub use session::ws_handler;
