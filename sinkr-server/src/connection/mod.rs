//! Per-socket connection handlers.
//!
//! Every accepted WebSocket gets one writer task draining a bounded
//! frame queue (so frame order per peer is queue order) and a reader
//! loop in the upgrade task. The registry owns the queue's only sender:
//! unregistering a peer ends its writer, which closes the socket, which
//! lands back here in the close path that reaps durable state.
//!
//! - [`channel`] — the channel engine (membership, notifications, sends)
//! - [`routing`] — envelope dispatch shared by both source transports

pub mod channel;
pub mod routing;

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;

use crate::db::{AppRow, PeerKind};
use crate::protocol::{MetadataEvent, SinkCommand, SinkFrame, SourceEnvelope, SourceReply};
use crate::registry::OUTBOUND_BUFFER;
use crate::server::SharedState;
use crate::shard::Shard;

/// Close code for sockets the server could not open or keep.
pub const CLOSE_FAILED_OPEN: u16 = 4000;

/// Client-sent normal closes (1000) are recorded under this code so
/// operator-induced drains, which really are 1000, stay distinguishable
/// in logs.
const CLOSE_TRANSLATED_NORMAL: u16 = 4100;

/// A sink connection dispatched to a worker shard.
pub async fn run_sink_socket(
    state: Arc<SharedState>,
    shard: Arc<Shard>,
    socket: WebSocket,
    app: AppRow,
) {
    let peer_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if state
        .with_db(|db| db.insert_peer(&peer_id, &app.id, PeerKind::Sink))
        .is_err()
    {
        close_failed(&mut ws_tx).await;
        return;
    }

    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    shard.registry.register(&peer_id, &app.id, tx);
    state.report_shard_load(&shard);
    let writer = tokio::spawn(write_frames(rx, ws_tx));

    shard
        .registry
        .send_frame(&peer_id, &SinkFrame::metadata(MetadataEvent::Init { peer_id: peer_id.clone() }));
    tracing::debug!(app = %app.id, peer = %peer_id, shard = shard.id, "sink connected");

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_sink_text(&state, &shard, &peer_id, text.as_str()),
            Ok(Message::Close(close)) => {
                log_close(&peer_id, close.as_ref());
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    shard.registry.unregister(&peer_id);
    channel::handle_disconnect(&state, &app.id, &peer_id);
    state.report_shard_load(&shard);
    let _ = writer.await;
    tracing::debug!(app = %app.id, peer = %peer_id, "sink disconnected");
}

fn handle_sink_text(state: &SharedState, shard: &Shard, peer_id: &str, text: &str) {
    if text == "ping" {
        shard.registry.send_raw(peer_id, "pong".to_string());
        return;
    }
    match serde_json::from_str::<SinkCommand>(text) {
        Ok(SinkCommand::RequestStoredMessages { channel_id, message_ids }) => {
            channel::replay_stored(state, &shard.registry, peer_id, &channel_id, &message_ids);
        }
        // Sinks cannot issue requests; anything unrecognized is dropped.
        Err(_) => {}
    }
}

/// A source connection, held on the coordinator. Each inbound text frame
/// is one envelope; replies are correlated by id and share the writer
/// queue with any pushed frames (sources are app peers too).
pub async fn run_source_socket(state: Arc<SharedState>, socket: WebSocket, app: AppRow) {
    let peer_id = uuid::Uuid::new_v4().to_string();
    let registry = &state.coordinator.local().registry;
    let (mut ws_tx, mut ws_rx) = socket.split();

    if state
        .with_db(|db| db.insert_peer(&peer_id, &app.id, PeerKind::Source))
        .is_err()
    {
        close_failed(&mut ws_tx).await;
        return;
    }

    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    registry.register(&peer_id, &app.id, tx);
    let writer = tokio::spawn(write_frames(rx, ws_tx));

    registry
        .send_frame(&peer_id, &SinkFrame::metadata(MetadataEvent::Init { peer_id: peer_id.clone() }));
    tracing::debug!(app = %app.id, peer = %peer_id, "source connected");

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<SourceEnvelope>(text.as_str()) {
                    Ok(envelope) => routing::execute(&state, &app, envelope),
                    Err(_) => match invalid_request_reply(text.as_str()) {
                        Some(reply) => reply,
                        None => continue,
                    },
                };
                match serde_json::to_string(&reply) {
                    Ok(raw) => {
                        registry.send_raw(&peer_id, raw);
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize reply"),
                }
            }
            Ok(Message::Close(close)) => {
                log_close(&peer_id, close.as_ref());
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    registry.unregister(&peer_id);
    channel::handle_disconnect(&state, &app.id, &peer_id);
    let _ = writer.await;
    tracing::debug!(app = %app.id, peer = %peer_id, "source disconnected");
}

/// A coordination-secret-bearing upgrade, handled on the coordinator
/// itself. Carries no app peer; it answers liveness pings and is
/// otherwise inert.
pub async fn run_internal_socket(mut socket: WebSocket) {
    tracing::debug!("internal connection opened");
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) if text.as_str() == "ping" => {
                if socket.send(Message::Text("pong".into())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    tracing::debug!("internal connection closed");
}

/// Writer half: drain the peer's queue onto the socket. Ends when the
/// registry drops the last sender or the socket dies. The send timeout
/// catches half-dead sockets that accept writes without draining them.
async fn write_frames(mut rx: mpsc::Receiver<String>, mut ws_tx: SplitSink<WebSocket, Message>) {
    let send_timeout = std::time::Duration::from_secs(30);
    while let Some(raw) = rx.recv().await {
        match tokio::time::timeout(send_timeout, ws_tx.send(Message::Text(raw.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                tracing::debug!("WebSocket send failed or timed out, closing");
                break;
            }
        }
    }
    let _ = ws_tx.close().await;
}

async fn close_failed(ws_tx: &mut SplitSink<WebSocket, Message>) {
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_FAILED_OPEN,
            reason: "Failed to open socket".into(),
        })))
        .await;
}

fn log_close(peer_id: &str, close: Option<&CloseFrame>) {
    let code = close.map(|c| c.code).unwrap_or(1000);
    let code = if code == 1000 { CLOSE_TRANSLATED_NORMAL } else { code };
    tracing::debug!(peer = peer_id, code, "peer sent close");
}

/// Reply for an unparseable source frame: correlate by id when one can
/// be recovered, otherwise drop the frame.
fn invalid_request_reply(text: &str) -> Option<SourceReply> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let id = value.get("id")?.as_str()?.to_string();
    let route = value
        .pointer("/data/route")
        .and_then(|r| r.as_str())
        .unwrap_or("unknown")
        .to_string();
    Some(SourceReply {
        id,
        route,
        response: crate::protocol::RouteOutcome::err(crate::protocol::RouteError::InvalidRequest),
    })
}
