//! MojiTalk Host Library Crate
//!
//! Serves the chat core to a client over WebSockets: configuration, the
//! shared services, the HTTP handlers and routing. The `host` binary is a
//! thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
