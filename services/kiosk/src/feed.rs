//! Secondary event feed: the server-sent event stream the aggregator consumes.
//!
//! The feed follows a target session id published on a `watch` channel. It holds no
//! stream while the target is `None`, opens `GET {task_base}/event` when a target is
//! set, and drops and reopens the stream whenever the target changes. Every event is
//! tagged with the session it was subscribed for, so the runtime can discard leftovers
//! from a previous subscription.

use futures_util::StreamExt;
use kiosk_core::{aggregator::SourceEvent, backoff::Backoff};
use reqwest::{Client, header::ACCEPT};
use reqwest_eventsource::{Event, EventSource, retry};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A stream for `session_id` opened; the aggregator starts from scratch.
    Opened { session_id: String },
    Source {
        session_id: String,
        event: SourceEvent,
    },
}

enum Outcome {
    Dropped,
    Retarget,
    Shutdown,
}

pub fn spawn(
    client: Client,
    task_base: &str,
    backoff: Backoff,
    target: watch::Receiver<Option<String>>,
    events: mpsc::Sender<FeedEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let url = format!("{}/event", task_base.trim_end_matches('/'));
    tokio::spawn(run(client, url, backoff, target, events, token))
}

#[instrument(skip_all, fields(url = %url))]
async fn run(
    client: Client,
    url: String,
    mut backoff: Backoff,
    mut target: watch::Receiver<Option<String>>,
    events: mpsc::Sender<FeedEvent>,
    token: CancellationToken,
) {
    loop {
        let current = target.borrow_and_update().clone();
        let Some(session_id) = current else {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = target.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        };

        match stream(&client, &url, &session_id, &mut backoff, &mut target, &events, &token).await
        {
            Outcome::Shutdown => break,
            Outcome::Retarget => {
                backoff.reset();
            }
            Outcome::Dropped => {
                let delay = backoff.next_delay();
                debug!(
                    %session_id,
                    delay_ms = delay.as_millis() as u64,
                    attempt = backoff.attempt(),
                    "Event feed dropped, scheduling reconnect"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = target.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        backoff.reset();
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!("Event feed stopped");
}

async fn stream(
    client: &Client,
    url: &str,
    session_id: &str,
    backoff: &mut Backoff,
    target: &mut watch::Receiver<Option<String>>,
    events: &mpsc::Sender<FeedEvent>,
    token: &CancellationToken,
) -> Outcome {
    let request = client.get(url).header(ACCEPT, "text/event-stream");
    let mut source = match EventSource::new(request) {
        Ok(source) => source,
        Err(e) => {
            warn!(error = %e, "Failed to build event feed request");
            return Outcome::Dropped;
        }
    };
    // Reconnects go through our own backoff so that a retarget can interrupt them.
    source.set_retry_policy(Box::new(retry::Never));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                source.close();
                return Outcome::Shutdown;
            }
            changed = target.changed() => {
                source.close();
                return if changed.is_err() { Outcome::Shutdown } else { Outcome::Retarget };
            }
            item = source.next() => match item {
                Some(Ok(Event::Open)) => {
                    info!(%session_id, "Event feed connected");
                    backoff.reset();
                    let opened = FeedEvent::Opened { session_id: session_id.to_string() };
                    if events.send(opened).await.is_err() {
                        source.close();
                        return Outcome::Shutdown;
                    }
                }
                Some(Ok(Event::Message(message))) => {
                    let Some(event) = SourceEvent::parse(&message.data) else {
                        continue;
                    };
                    let tagged = FeedEvent::Source { session_id: session_id.to_string(), event };
                    if events.send(tagged).await.is_err() {
                        source.close();
                        return Outcome::Shutdown;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Event feed error");
                    source.close();
                    return Outcome::Dropped;
                }
                None => return Outcome::Dropped,
            },
        }
    }
}
