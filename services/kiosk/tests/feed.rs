use kiosk_client::feed::{self, FeedEvent};
use kiosk_core::{aggregator::SourceEvent, backoff::Backoff};
use serde_json::json;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

async fn next_event(events: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for feed event")
        .expect("feed event channel closed")
}

/// Accepts one connection and reads its request head.
async fn accept_request(listener: &TcpListener) -> (TcpStream, String) {
    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("feed did not connect")
        .unwrap();
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up before finishing its request");
        head.extend_from_slice(&chunk[..n]);
    }
    (stream, String::from_utf8_lossy(&head).into_owned())
}

async fn start_stream(stream: &mut TcpStream) {
    stream
        .write_all(
            b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n",
        )
        .await
        .unwrap();
}

async fn push(stream: &mut TcpStream, data: &str) {
    stream
        .write_all(format!("data: {data}\n\n").as_bytes())
        .await
        .unwrap();
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_feed_tags_events_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let task_base = format!("http://{}/oc", listener.local_addr().unwrap());
    let token = CancellationToken::new();
    let (target_tx, target) = watch::channel(Some("oc-1".to_string()));
    let (events_tx, mut events) = mpsc::channel(16);
    let task = feed::spawn(
        client(),
        &task_base,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        target,
        events_tx,
        token.clone(),
    );

    let (mut server, request) = accept_request(&listener).await;
    assert!(request.starts_with("GET /oc/event "), "{request}");
    start_stream(&mut server).await;
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Opened {
            session_id: "oc-1".into()
        }
    );

    let delta = json!({
        "type": "message.part.delta",
        "properties": {"sessionID": "oc-1", "partID": "p1", "delta": {"text": "hi"}}
    })
    .to_string();
    push(&mut server, "not json at all").await;
    push(&mut server, &delta).await;
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Source {
            session_id: "oc-1".into(),
            event: SourceEvent::parse(&delta).unwrap(),
        }
    );

    // Server hangs up; the feed comes back on its own after the short base delay.
    drop(server);
    let (mut server, _) = accept_request(&listener).await;
    start_stream(&mut server).await;
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Opened {
            session_id: "oc-1".into()
        }
    );

    target_tx.send(Some("oc-2".to_string())).unwrap();
    let (mut retargeted, request) = accept_request(&listener).await;
    assert!(request.starts_with("GET /oc/event "), "{request}");
    start_stream(&mut retargeted).await;
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Opened {
            session_id: "oc-2".into()
        }
    );

    token.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("feed did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_feed_waits_for_target_and_retarget_skips_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let task_base = format!("http://{}/oc", listener.local_addr().unwrap());
    let token = CancellationToken::new();
    let (target_tx, target) = watch::channel(None);
    let (events_tx, mut events) = mpsc::channel(16);
    let task = feed::spawn(
        client(),
        &task_base,
        Backoff::new(Duration::from_secs(30), Duration::from_secs(60)),
        target,
        events_tx,
        token.clone(),
    );

    // No target, no stream.
    assert!(
        timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err()
    );

    target_tx.send(Some("oc-1".to_string())).unwrap();
    let (mut server, _) = accept_request(&listener).await;
    server
        .write_all(
            b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    drop(server);

    // The feed is now sleeping off a 30 second delay. A new target cuts it short.
    target_tx.send(Some("oc-2".to_string())).unwrap();
    let (mut server, _) = accept_request(&listener).await;
    start_stream(&mut server).await;
    assert_eq!(
        next_event(&mut events).await,
        FeedEvent::Opened {
            session_id: "oc-2".into()
        }
    );

    token.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("feed did not stop")
        .unwrap();
}
