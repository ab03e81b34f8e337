//! Kiosk Core
//!
//! I/O-free state machines behind the kiosk client: the realtime envelope protocol,
//! the session synchronization engine, the session directory, the incremental event
//! aggregator and the background task tracker. The async runtime in `kiosk-client`
//! owns one instance of each and carries out the [`engine::Effect`]s they request.

pub mod aggregator;
pub mod backoff;
pub mod directory;
pub mod engine;
pub mod models;
pub mod protocol;
pub mod tasks;
