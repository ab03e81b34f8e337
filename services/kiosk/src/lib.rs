//! Kiosk Client
//!
//! Async runtime around `kiosk-core`: configuration, the WebSocket transport, the HTTP
//! collaborators, the server-sent event feed, timers and the event loop that owns all
//! client state. The `kiosk` binary puts a line-oriented console on top.

pub mod api;
pub mod config;
pub mod console;
pub mod feed;
pub mod runtime;
pub mod state;
pub mod timers;
pub mod view;
pub mod ws;
