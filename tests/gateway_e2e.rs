//! Drives a real gateway over TCP with a WebSocket client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tunnelgate::config::GatewayConfig;
use tunnelgate::{AccessSession, CommandRouter, GatewayServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Feed = mpsc::UnboundedSender<Result<Value, String>>;

struct Fixture {
    gateway: GatewayServer,
    session: AccessSession,
    pin: String,
    port: u16,
    invocations: Arc<AtomicUsize>,
    feeds: Arc<Mutex<Vec<Feed>>>,
}

impl Fixture {
    async fn start() -> Self {
        let invocations = Arc::new(AtomicUsize::new(0));
        let feeds: Arc<Mutex<Vec<Feed>>> = Arc::new(Mutex::new(Vec::new()));
        let (count, sinks) = (invocations.clone(), feeds.clone());
        let router = CommandRouter::builder()
            .call("echo.ping", |params| async move { Ok(params) })
            .call("jobs.fail", |_| async { Err("job exploded".to_string()) })
            .shared_stream("agent.stream", "streamId", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                sinks.lock().unwrap().push(tx);
                futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
            })
            .build()
            .unwrap();

        let session = AccessSession::new();
        let pin = session.create();
        let gateway = GatewayServer::new(GatewayConfig::default(), session.clone(), Arc::new(router));
        let port = gateway.start().await.unwrap();
        Self {
            gateway,
            session,
            pin,
            port,
            invocations,
            feeds,
        }
    }

    async fn connect(&self) -> Ws {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws", self.port))
            .await
            .unwrap();
        ws
    }

    /// Connect and complete the auth handshake.
    async fn login(&self) -> Ws {
        let mut ws = self.connect().await;
        assert_eq!(recv(&mut ws).await, json!({"id": null, "type": "auth_required"}));
        send(&mut ws, json!({"id": "auth", "type": "auth", "pin": self.pin})).await;
        assert_eq!(recv(&mut ws).await, json!({"id": "auth", "type": "auth_success"}));
        ws
    }

    fn emit(&self, item: Result<Value, String>) {
        let feeds = self.feeds.lock().unwrap();
        feeds.last().unwrap().send(item).unwrap();
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn auth_then_call_round_trip() {
    let fx = Fixture::start().await;
    let mut ws = fx.connect().await;

    assert_eq!(recv(&mut ws).await, json!({"id": null, "type": "auth_required"}));
    send(&mut ws, json!({"id": "1", "type": "auth", "pin": fx.pin})).await;
    assert_eq!(recv(&mut ws).await, json!({"id": "1", "type": "auth_success"}));
    assert_eq!(fx.session.client_count(), 1);

    send(&mut ws, json!({"id": "2", "type": "call", "method": "echo.ping", "params": {}})).await;
    assert_eq!(recv(&mut ws).await, json!({"id": "2", "type": "result", "data": {}}));

    fx.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_pin_keeps_socket_open_for_retry() {
    let fx = Fixture::start().await;
    let mut ws = fx.connect().await;
    recv(&mut ws).await;

    let wrong = if fx.pin == "111111" { "222222" } else { "111111" };
    send(&mut ws, json!({"id": "a", "type": "auth", "pin": wrong})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["id"], "a");
    assert_eq!(reply["type"], "auth_failed");

    send(&mut ws, json!({"id": "b", "type": "auth"})).await;
    assert_eq!(recv(&mut ws).await["type"], "auth_failed");

    send(&mut ws, json!({"id": "c", "type": "auth", "pin": fx.pin})).await;
    assert_eq!(recv(&mut ws).await, json!({"id": "c", "type": "auth_success"}));
}

#[tokio::test]
async fn repeated_auth_on_a_live_socket_still_checks_the_pin() {
    let fx = Fixture::start().await;
    let mut ws = fx.login().await;

    let wrong = if fx.pin == "111111" { "222222" } else { "111111" };
    send(&mut ws, json!({"id": "a", "type": "auth", "pin": wrong})).await;
    assert_eq!(recv(&mut ws).await["type"], "auth_failed");

    send(&mut ws, json!({"id": "b", "type": "auth", "pin": fx.pin})).await;
    assert_eq!(recv(&mut ws).await, json!({"id": "b", "type": "auth_success"}));
    assert_eq!(fx.session.client_count(), 1);

    fx.session.end();
    send(&mut ws, json!({"id": "c", "type": "auth", "pin": fx.pin})).await;
    assert_eq!(recv(&mut ws).await["type"], "auth_failed");
}

#[tokio::test]
async fn requests_before_auth_are_refused() {
    let fx = Fixture::start().await;
    let mut ws = fx.connect().await;
    recv(&mut ws).await;

    send(&mut ws, json!({"id": "1", "type": "call", "method": "echo.ping"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["id"], "1");
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "Not authenticated");
}

#[tokio::test]
async fn malformed_frame_does_not_change_auth_state() {
    let fx = Fixture::start().await;
    let mut ws = fx.login().await;

    ws.send(Message::Text("{not json".to_string().into())).await.unwrap();
    let reply = recv(&mut ws).await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["type"], "error");

    send(&mut ws, json!({"id": "2", "type": "call", "method": "echo.ping", "params": [1]})).await;
    assert_eq!(recv(&mut ws).await, json!({"id": "2", "type": "result", "data": [1]}));
}

#[tokio::test]
async fn unknown_procedures_and_failures_are_per_message_errors() {
    let fx = Fixture::start().await;
    let mut ws = fx.login().await;

    send(&mut ws, json!({"id": "1", "type": "call", "method": "nope.ping"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["error"].as_str().unwrap().contains("nope"));

    send(&mut ws, json!({"id": "2", "type": "call", "method": "echo.pong"})).await;
    assert_eq!(recv(&mut ws).await["type"], "error");

    send(&mut ws, json!({"id": "3", "type": "call", "method": "jobs.fail"})).await;
    assert_eq!(
        recv(&mut ws).await,
        json!({"id": "3", "type": "error", "error": "job exploded"})
    );

    send(&mut ws, json!({"id": "4", "type": "call", "method": "echo.ping", "params": "ok"})).await;
    assert_eq!(recv(&mut ws).await["data"], "ok");
}

#[tokio::test]
async fn shared_stream_is_invoked_once_for_many_sockets() {
    let fx = Fixture::start().await;
    let mut a = fx.login().await;
    let mut b = fx.login().await;

    let call = |id: &str| {
        json!({"id": id, "type": "call", "method": "agent.stream", "params": {"streamId": "s1"}})
    };
    send(&mut a, call("a1")).await;
    assert_eq!(recv(&mut a).await, json!({"id": "a1", "type": "result", "data": {"stream": "s1"}}));
    send(&mut b, call("b1")).await;
    assert_eq!(recv(&mut b).await, json!({"id": "b1", "type": "result", "data": {"stream": "s1"}}));
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 1);

    fx.emit(Ok(json!({"step": 1})));
    fx.emit(Ok(json!({"step": 2})));
    for (ws, id) in [(&mut a, "a1"), (&mut b, "b1")] {
        for step in [1, 2] {
            assert_eq!(
                recv(ws).await,
                json!({
                    "id": id,
                    "type": "subscription",
                    "channel": "s1",
                    "data": {"type": "data", "data": {"step": step}}
                })
            );
        }
    }

    // b leaves explicitly; a keeps receiving.
    send(&mut b, json!({"id": "b2", "type": "unsubscribe", "channel": "s1"})).await;
    assert_eq!(recv(&mut b).await, json!({"id": "b2", "type": "result", "data": {"channel": "s1"}}));
    fx.emit(Ok(json!("only-a")));
    assert_eq!(recv(&mut a).await["data"]["data"], "only-a");

    // Closing the last member tears the stream down.
    a.close(None).await.unwrap();
    let subs = fx.gateway.subscriptions().clone();
    assert!(eventually(|| { let subs = subs.clone(); async move { subs.is_empty().await } }).await);
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn topic_broadcast_reaches_subscribers_only() {
    let fx = Fixture::start().await;
    let mut subscribed = fx.login().await;
    let mut other = fx.login().await;

    send(&mut subscribed, json!({"id": "1", "type": "subscribe", "channel": "news"})).await;
    assert_eq!(
        recv(&mut subscribed).await,
        json!({"id": "1", "type": "result", "data": {"channel": "news"}})
    );

    assert_eq!(fx.gateway.broadcast("news", json!({"headline": "hi"})).await, 1);
    assert_eq!(
        recv(&mut subscribed).await,
        json!({"id": null, "type": "subscription", "channel": "news", "data": {"headline": "hi"}})
    );

    send(&mut other, json!({"id": "p", "type": "call", "method": "echo.ping", "params": 1})).await;
    assert_eq!(recv(&mut other).await["id"], "p");
}

#[tokio::test]
async fn closing_socket_releases_session_client() {
    let fx = Fixture::start().await;
    let mut ws = fx.login().await;
    assert_eq!(fx.session.client_count(), 1);
    ws.close(None).await.unwrap();
    let session = fx.session.clone();
    assert!(eventually(|| { let session = session.clone(); async move { session.client_count() == 0 } }).await);
}

#[tokio::test]
async fn stop_closes_sockets() {
    let fx = Fixture::start().await;
    let mut ws = fx.login().await;
    fx.gateway.stop().await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(connect_async(format!("ws://127.0.0.1:{}/ws", fx.port)).await.is_err());
}
