use futures_util::{SinkExt, StreamExt};
use kiosk_client::ws::{self, TransportEvent};
use kiosk_core::{
    backoff::Backoff,
    protocol::{ClientEnvelope, PipelineState, ServerEnvelope},
};
use std::time::Duration;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

#[tokio::test]
async fn test_transport_delivers_sends_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let token = CancellationToken::new();
    let (events_tx, mut events) = mpsc::channel(16);
    let (handle, task) = ws::spawn(
        url,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        events_tx,
        token.clone(),
    );

    // Nothing is open yet, so this is dropped rather than queued.
    assert!(!handle.send(ClientEnvelope::PttStop));

    let (stream, _) = listener.accept().await.unwrap();
    let mut server = accept_async(stream).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    assert!(handle.is_open());

    server
        .send(Message::Text("not json at all".into()))
        .await
        .unwrap();
    server
        .send(Message::Text(r#"{"type":"brand_new_thing"}"#.into()))
        .await
        .unwrap();
    server
        .send(Message::Text(
            r#"{"type":"state_changed","state":"thinking","mode":"ptt"}"#.into(),
        ))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Envelope(ServerEnvelope::Unknown)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Envelope(ServerEnvelope::StateChanged {
            state: PipelineState::Thinking,
            mode: Some("ptt".into()),
            info: None,
        })
    );

    assert!(handle.send(ClientEnvelope::PttStart));
    let frame = timeout(Duration::from_secs(5), server.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.to_text().unwrap(), r#"{"type":"ptt_start"}"#);

    server.close(None).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Closed {
            retry_in: Duration::from_millis(10)
        }
    );
    assert!(!handle.is_open());

    let (stream, _) = listener.accept().await.unwrap();
    let _server = accept_async(stream).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    token.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("transport did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_transport_backs_off_until_cancelled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let token = CancellationToken::new();
    let (events_tx, mut events) = mpsc::channel(16);
    let (handle, task) = ws::spawn(
        url,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        events_tx,
        token.clone(),
    );

    for expected in [10, 20, 40, 40] {
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Closed {
                retry_in: Duration::from_millis(expected)
            }
        );
    }
    assert!(!handle.send(ClientEnvelope::PttStart));

    token.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("transport did not stop")
        .unwrap();
}
