//! Connection loop of the Transport Channel.

use super::{TransportEvent, TransportHandle};
use futures_util::{SinkExt, StreamExt};
use kiosk_core::{
    backoff::Backoff,
    protocol::{ClientEnvelope, ServerEnvelope},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How one connection ended.
enum Ended {
    /// Closed by the peer, by a read/write error, or by the network.
    Dropped,
    /// Torn down locally: the token was cancelled or the owner went away.
    Shutdown,
}

/// Starts the transport task. It connects to `url`, reports through `events` and stops
/// for good once `token` is cancelled.
pub fn spawn(
    url: String,
    backoff: Backoff,
    events: mpsc::Sender<TransportEvent>,
    token: CancellationToken,
) -> (TransportHandle, JoinHandle<()>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(false));
    let handle = TransportHandle::new(outbound_tx, open.clone());
    let task = tokio::spawn(run(url, backoff, events, outbound_rx, open, token));
    (handle, task)
}

#[instrument(skip_all, fields(url = %url))]
async fn run(
    url: String,
    mut backoff: Backoff,
    events: mpsc::Sender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<ClientEnvelope>,
    open: Arc<AtomicBool>,
    token: CancellationToken,
) {
    loop {
        let attempt = tokio::select! {
            _ = token.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match attempt {
            Ok((socket, _)) => {
                info!(attempt = backoff.attempt(), "Transport connected");
                backoff.reset();
                // Whatever was queued for the previous connection is stale now.
                while outbound.try_recv().is_ok() {}
                open.store(true, Ordering::Release);
                if events.send(TransportEvent::Opened).await.is_err() {
                    open.store(false, Ordering::Release);
                    break;
                }

                let ended = serve(socket, &mut outbound, &events, &token).await;
                open.store(false, Ordering::Release);
                if let Ended::Shutdown = ended {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, attempt = backoff.attempt(), "Transport connect failed");
            }
        }

        let delay = backoff.next_delay();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempt(),
            "Transport closed, scheduling reconnect"
        );
        if events
            .send(TransportEvent::Closed { retry_in: delay })
            .await
            .is_err()
        {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("Transport stopped");
}

/// Pumps one open connection until it drops or the transport is torn down.
async fn serve(
    socket: Socket,
    outbound: &mut mpsc::UnboundedReceiver<ClientEnvelope>,
    events: &mpsc::Sender<TransportEvent>,
    token: &CancellationToken,
) -> Ended {
    let (mut sink, mut stream) = socket.split();
    let ended = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break Ended::Shutdown,
            Some(envelope) = outbound.recv() => {
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    warn!(error = %e, "Transport write failed");
                    break Ended::Dropped;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(envelope) = ServerEnvelope::parse(&text) else {
                        continue;
                    };
                    if events.send(TransportEvent::Envelope(envelope)).await.is_err() {
                        break Ended::Shutdown;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Server closed the connection");
                    break Ended::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Transport read failed");
                    break Ended::Dropped;
                }
                None => break Ended::Dropped,
            },
        }
    };

    if let Ended::Shutdown = ended {
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Socket close failed");
        }
    }
    ended
}
