//! Transport Channel: the kiosk's single WebSocket connection to the voice pipeline.
//!
//! A spawned task owns the socket and reconnects forever with exponential backoff. The
//! runtime talks to it through a [`TransportHandle`] and hears back through
//! [`TransportEvent`]s, delivered in arrival order.

pub mod transport;

use kiosk_core::protocol::{ClientEnvelope, ServerEnvelope};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub use transport::spawn;

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Envelope(ServerEnvelope),
    /// The connection closed or could not be opened; the next attempt runs after `retry_in`.
    Closed { retry_in: Duration },
}

/// Sending side of the Transport Channel.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    open: Arc<AtomicBool>,
}

impl TransportHandle {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<ClientEnvelope>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self { outbound, open }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queues an envelope for the open connection. Returns `false` (and drops the
    /// envelope) when the socket is not open.
    pub fn send(&self, envelope: ClientEnvelope) -> bool {
        if !self.is_open() {
            debug!(?envelope, "Transport not open, dropping envelope");
            return false;
        }
        self.outbound.send(envelope).is_ok()
    }
}
