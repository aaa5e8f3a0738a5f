//! Per-shard peer registry.
//!
//! Maps a peer id to its live outbound handle (a bounded mpsc sender
//! drained by the socket's writer task) and keeps a reverse index from
//! app id to peer ids for broadcast fan-out.
//!
//! The registry owns the last sender for each peer: dropping a handle on
//! unregister ends the writer task, which closes the socket, which runs
//! the close callback that reaps durable state. A failed `try_send`
//! (saturated buffer or closed channel) therefore marks the peer dead by
//! unregistering it — the durable row is removed by the close path, not
//! here.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::SinkFrame;

/// Capacity of each peer's outbound frame buffer. A sink that falls this
/// far behind is treated as dead rather than blocking fan-out.
pub const OUTBOUND_BUFFER: usize = 64;

struct RegisteredPeer {
    app_id: String,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, RegisteredPeer>,
    by_app: HashMap<String, HashSet<String>>,
}

/// Thread-safe peer index for one shard.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer at socket open.
    pub fn register(&self, peer_id: &str, app_id: &str, tx: mpsc::Sender<String>) {
        let mut inner = self.inner.lock();
        inner.by_id.insert(
            peer_id.to_string(),
            RegisteredPeer { app_id: app_id.to_string(), tx },
        );
        inner
            .by_app
            .entry(app_id.to_string())
            .or_default()
            .insert(peer_id.to_string());
    }

    /// Remove a peer at socket close. Idempotent; returns whether the
    /// peer was present.
    pub fn unregister(&self, peer_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.by_id.remove(peer_id) else {
            return false;
        };
        if let Some(ids) = inner.by_app.get_mut(&peer.app_id) {
            ids.remove(peer_id);
            if ids.is_empty() {
                inner.by_app.remove(&peer.app_id);
            }
        }
        true
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.inner.lock().by_id.contains_key(peer_id)
    }

    /// Look up a live peer, returning the app it belongs to. The
    /// outbound sender itself stays private — writes go through
    /// [`PeerRegistry::send_frame`] / [`PeerRegistry::send_raw`] so
    /// dead-peer handling stays in one place.
    pub fn lookup(&self, peer_id: &str) -> Option<String> {
        self.inner.lock().by_id.get(peer_id).map(|p| p.app_id.clone())
    }

    /// Number of live peers on this shard.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_id.is_empty()
    }

    /// Peer ids currently registered for an app.
    pub fn app_peer_ids(&self, app_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_app
            .get(app_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Serialize a frame and deliver it to one peer, if local. Failure
    /// marks the peer dead (see module docs) and returns false.
    pub fn send_frame(&self, peer_id: &str, frame: &SinkFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(raw) => self.send_raw(peer_id, raw),
            Err(e) => {
                tracing::error!(peer = peer_id, error = %e, "failed to serialize sink frame");
                false
            }
        }
    }

    /// Deliver an already-serialized frame to one peer, if local.
    pub fn send_raw(&self, peer_id: &str, raw: String) -> bool {
        let tx = self.inner.lock().by_id.get(peer_id).map(|p| p.tx.clone());
        let Some(tx) = tx else {
            return false;
        };
        if tx.try_send(raw).is_err() {
            tracing::debug!(peer = peer_id, "outbound buffer saturated or closed, dropping peer");
            self.unregister(peer_id);
            return false;
        }
        true
    }

    /// Deliver one serialized frame to every listed peer that is local.
    /// Returns how many were delivered; dead peers are swallowed.
    pub fn deliver_to(&self, peer_ids: &[String], raw: &str) -> usize {
        let targets: Vec<(String, mpsc::Sender<String>)> = {
            let inner = self.inner.lock();
            peer_ids
                .iter()
                .filter_map(|id| inner.by_id.get(id).map(|p| (id.clone(), p.tx.clone())))
                .collect()
        };
        let mut delivered = 0;
        for (peer_id, tx) in targets {
            if tx.try_send(raw.to_string()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(peer = %peer_id, "outbound buffer saturated or closed, dropping peer");
                self.unregister(&peer_id);
            }
        }
        delivered
    }

    /// Deliver one serialized frame to every local peer of an app.
    pub fn broadcast_app(&self, app_id: &str, raw: &str) -> usize {
        let ids = self.app_peer_ids(app_id);
        self.deliver_to(&ids, raw)
    }
}
