//! Transport-level tests: a real server on an ephemeral port, sinks and
//! sources speaking actual WebSocket, plus the HTTP source endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use sinkr_server::config::ServerConfig;
use sinkr_server::server::SharedState;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const APP: &str = "A";
const SECRET: &str = "K";

async fn spawn_server() -> (SocketAddr, Arc<SharedState>) {
    let mut config = ServerConfig::for_tests();
    config.seed_apps = vec![format!("{APP}:{SECRET}")];
    config.coordination_secret = Some("coord-secret".to_string());
    let state = SharedState::new(config).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = sinkr_server::web::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if msg.is_text() {
            return msg.into_text().unwrap().to_string();
        }
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    serde_json::from_str(&next_text(ws).await).unwrap()
}

/// Connect a sink and consume its init frame, returning the peer id.
async fn connect_sink(addr: SocketAddr) -> (Ws, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/{APP}")).await.unwrap();
    let init = next_json(&mut ws).await;
    assert_eq!(init["source"], "metadata");
    assert_eq!(init["data"]["event"], "init");
    let peer_id = init["data"]["peerId"].as_str().unwrap().to_string();
    (ws, peer_id)
}

async fn connect_source(addr: SocketAddr) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{addr}/{APP}?sinkrKey={SECRET}"))
        .await
        .unwrap();
    let init = next_json(&mut ws).await;
    assert_eq!(init["data"]["event"], "init");
    ws
}

async fn request(ws: &mut Ws, id: &str, data: Value) -> Value {
    let envelope = json!({"id": id, "data": data}).to_string();
    ws.send(Message::Text(envelope.into())).await.unwrap();
    loop {
        let frame = next_json(ws).await;
        // Sources can also receive pushed frames; replies are the ones
        // carrying a route.
        if frame["id"] == id && frame.get("route").is_some() {
            return frame;
        }
    }
}

#[tokio::test]
async fn unknown_app_upgrade_rejected() {
    let (addr, _state) = spawn_server().await;
    assert!(connect_async(format!("ws://{addr}/nope")).await.is_err());
}

#[tokio::test]
async fn bad_source_key_rejected() {
    let (addr, _state) = spawn_server().await;
    assert!(connect_async(format!("ws://{addr}/{APP}?sinkrKey=wrong")).await.is_err());
}

#[tokio::test]
async fn disabled_app_upgrade_rejected() {
    let (addr, state) = spawn_server().await;
    state.with_db(|db| db.upsert_app(APP, APP, SECRET, false)).unwrap();
    assert!(connect_async(format!("ws://{addr}/{APP}")).await.is_err());
}

#[tokio::test]
async fn internal_upgrade_handled_on_coordinator() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

    let (addr, state) = spawn_server().await;

    let mut request = format!("ws://{addr}/{APP}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Bearer coord-secret".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    // No init frame: this is not an app peer, just a liveness surface.
    ws.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");
    assert_eq!(state.coordinator.connection_count(), 0);

    // App validity is enforced before the bearer branch: a nonexistent
    // app id is rejected even with the right secret.
    let mut request = format!("ws://{addr}/ghost-app").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Bearer coord-secret".parse().unwrap());
    assert!(connect_async(request).await.is_err());
}

#[tokio::test]
async fn sink_ping_pong() {
    let (addr, _state) = spawn_server().await;
    let (mut ws, _peer) = connect_sink(addr).await;

    ws.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");
}

#[tokio::test]
async fn broadcast_over_the_wire() {
    let (addr, _state) = spawn_server().await;
    let (mut s1, _) = connect_sink(addr).await;
    let (mut s2, _) = connect_sink(addr).await;
    let (mut s3, _) = connect_sink(addr).await;
    let mut source = connect_source(addr).await;

    let reply = request(
        &mut source,
        "m1",
        json!({"route": "global.messages.send", "request": {"event": "x", "message": {"type": "plain", "message": {"n": 1}}}}),
    )
    .await;
    assert_eq!(reply["response"]["success"], true);

    let expected = json!({
        "id": "m1",
        "source": "message",
        "data": {"event": "x", "from": {"source": "broadcast"}, "message": {"type": "plain", "message": {"n": 1}}}
    });
    for sink in [&mut s1, &mut s2, &mut s3] {
        assert_eq!(next_json(sink).await, expected);
    }
}

#[tokio::test]
async fn stored_replay_over_the_wire() {
    let (addr, _state) = spawn_server().await;
    let mut source = connect_source(addr).await;

    let created = request(
        &mut source,
        "create",
        json!({"route": "channel.create", "request": {"name": "log", "authMode": "public", "storeMessages": true}}),
    )
    .await;
    let channel_id = created["response"]["channelId"].as_str().unwrap().to_string();

    let sent = request(
        &mut source,
        "msg-1",
        json!({"route": "channel.messages.send", "request": {"channelId": channel_id, "event": "x", "message": {"type": "plain", "message": {"n": 1}}}}),
    )
    .await;
    assert_eq!(sent["response"]["success"], true);

    let (mut sink, peer_id) = connect_sink(addr).await;
    let subscribed = request(
        &mut source,
        "sub",
        json!({"route": "channel.subscribers.add", "request": {"subscriberId": peer_id, "channelId": channel_id}}),
    )
    .await;
    assert_eq!(subscribed["response"]["success"], true);

    let join = next_json(&mut sink).await;
    assert_eq!(join["data"]["event"], "join-channel");
    assert_eq!(join["data"]["channelStoredMessages"][0]["id"], "msg-1");

    let ask = json!({"event": "request-stored-messages", "channelId": channel_id, "messageIds": ["msg-1"]});
    sink.send(Message::Text(ask.to_string().into())).await.unwrap();
    let replayed = next_json(&mut sink).await;
    assert_eq!(replayed["id"], "msg-1");
    assert_eq!(replayed["data"]["from"], json!({"source": "channel", "channelId": channel_id}));
}

#[tokio::test]
async fn disconnect_notifies_co_members_over_the_wire() {
    let (addr, _state) = spawn_server().await;
    let mut source = connect_source(addr).await;
    let (mut s1, p1) = connect_sink(addr).await;
    let (mut s2, p2) = connect_sink(addr).await;

    let created = request(
        &mut source,
        "create",
        json!({"route": "channel.create", "request": {"name": "room", "authMode": "public", "storeMessages": false}}),
    )
    .await;
    let channel_id = created["response"]["channelId"].as_str().unwrap().to_string();
    for (id, peer) in [("sub1", &p1), ("sub2", &p2)] {
        let reply = request(
            &mut source,
            id,
            json!({"route": "channel.subscribers.add", "request": {"subscriberId": peer, "channelId": channel_id}}),
        )
        .await;
        assert_eq!(reply["response"]["success"], true);
    }
    // s1: join-channel, then member-join for s2
    assert_eq!(next_json(&mut s1).await["data"]["event"], "join-channel");
    assert_eq!(next_json(&mut s1).await["data"]["event"], "member-join");
    assert_eq!(next_json(&mut s2).await["data"]["event"], "join-channel");

    s2.close(None).await.unwrap();

    let leave = next_json(&mut s1).await;
    assert_eq!(leave["data"]["event"], "member-leave");
    assert_eq!(leave["data"]["member"]["id"], p2.as_str());
}

#[tokio::test]
async fn malformed_source_frame_gets_invalid_request() {
    let (addr, _state) = spawn_server().await;
    let mut source = connect_source(addr).await;

    source
        .send(Message::Text(r#"{"id":"bad-1","data":{"route":"no.such.route","request":{}}}"#.into()))
        .await
        .unwrap();
    let reply = next_json(&mut source).await;
    assert_eq!(reply["id"], "bad-1");
    assert_eq!(reply["response"], json!({"success": false, "error": "Invalid request"}));
}

// ── HTTP source transport ──────────────────────────────────────────────

async fn http_post(addr: SocketAddr, path: &str, auth: Option<&str>, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let auth_header = auth.map(|a| format!("Authorization: Bearer {a}\r\n")).unwrap_or_default();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\n{auth_header}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status: u16 = text.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn http_source_matches_websocket_effects() {
    let (addr, _state) = spawn_server().await;
    let (mut sink, _) = connect_sink(addr).await;

    let envelope = json!({
        "id": "h1",
        "data": {"route": "global.messages.send", "request": {"event": "x", "message": {"type": "plain", "message": 1}}}
    });
    let (status, body) = http_post(addr, &format!("/{APP}"), Some(SECRET), &envelope.to_string()).await;
    assert_eq!(status, 200);
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        reply,
        json!({"id": "h1", "route": "global.messages.send", "response": {"success": true}})
    );

    let frame = next_json(&mut sink).await;
    assert_eq!(frame["id"], "h1");
    assert_eq!(frame["data"]["from"], json!({"source": "broadcast"}));
}

#[tokio::test]
async fn http_auth_and_validation_failures() {
    let (addr, _state) = spawn_server().await;

    let envelope = json!({"id": "h1", "data": {"route": "channel.delete", "request": {"channelId": "x"}}});
    let (status, _) = http_post(addr, &format!("/{APP}"), None, &envelope.to_string()).await;
    assert_eq!(status, 401);

    let (status, _) = http_post(addr, &format!("/{APP}"), Some("wrong"), &envelope.to_string()).await;
    assert_eq!(status, 401);

    let (status, _) = http_post(addr, "/nope", Some(SECRET), &envelope.to_string()).await;
    assert_eq!(status, 404);

    let (status, body) = http_post(addr, &format!("/{APP}"), Some(SECRET), "not json").await;
    assert_eq!(status, 400);
    let err: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(err, json!({"success": false, "error": "Invalid request"}));
}

async fn http_get(addr: SocketAddr, path: &str, auth: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let auth_header = auth.map(|a| format!("Authorization: Bearer {a}\r\n")).unwrap_or_default();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n{auth_header}Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status: u16 = text.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn channel_listing_api() {
    let (addr, _state) = spawn_server().await;
    let mut source = connect_source(addr).await;
    let created = request(
        &mut source,
        "create",
        json!({"route": "channel.create", "request": {"name": "log", "authMode": "public", "storeMessages": true}}),
    )
    .await;
    let channel_id = created["response"]["channelId"].as_str().unwrap().to_string();
    request(
        &mut source,
        "m1",
        json!({"route": "channel.messages.send", "request": {"channelId": channel_id, "event": "e", "message": {"type": "plain", "message": 1}}}),
    )
    .await;

    let (status, body) = http_get(addr, &format!("/api/v1/{APP}/channels"), Some(SECRET)).await;
    assert_eq!(status, 200);
    let channels: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        channels,
        json!([{"id": channel_id, "name": "log", "auth": "public", "store": true, "subscribers": 0}])
    );

    let (status, body) =
        http_get(addr, &format!("/api/v1/{APP}/channels/{channel_id}/messages"), Some(SECRET)).await;
    assert_eq!(status, 200);
    let refs: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(refs[0]["id"], "m1");

    let (status, _) = http_get(addr, &format!("/api/v1/{APP}/channels"), None).await;
    assert_eq!(status, 401);
    let (status, _) =
        http_get(addr, &format!("/api/v1/{APP}/channels/missing/messages"), Some(SECRET)).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn internal_shard_table_guarded() {
    let (addr, state) = spawn_server().await;
    let (_sink, _peer) = connect_sink(addr).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /internal/shards HTTP/1.1\r\nHost: {addr}\r\nAuthorization: Bearer coord-secret\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    let body = text.split_once("\r\n\r\n").unwrap().1;
    let loads: Value = serde_json::from_str(body).unwrap();
    assert_eq!(loads[0]["connections"], 1);
    assert_eq!(state.coordinator.shard_count(), 1);

    // Without the bearer: unauthorized.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET /internal/shards HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 401"));
}
