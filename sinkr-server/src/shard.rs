//! A worker shard: one peer-owning unit of the deployment.
//!
//! Each shard owns a [`PeerRegistry`] holding the sockets dispatched to
//! it. Delivery operations resolve which of the requested peers are
//! local and push to them; per-peer send failures are swallowed (the
//! registry reaps dead peers) and never fail the shard-level outcome.

use crate::registry::PeerRegistry;

/// Shard id 0 is reserved for the coordinator's own registry (source
/// peers and coordination-internal connections); dispatched worker
/// shards get ids from the persistent load table, starting at 1.
pub const COORDINATOR_SHARD_ID: i64 = 0;

/// Per-shard result of one delivery operation.
#[derive(Debug, Clone, Copy)]
pub struct ShardOutcome {
    /// Whether the shard serviced the operation. Delivery to individual
    /// dead peers does not clear this; only an internal failure would.
    pub success: bool,
    /// How many local peers the frame was pushed to.
    pub delivered: usize,
}

pub struct Shard {
    pub id: i64,
    pub registry: PeerRegistry,
}

impl Shard {
    pub fn new(id: i64) -> Self {
        Self { id, registry: PeerRegistry::new() }
    }

    /// Live connection count, reported to the coordinator after every
    /// open and close.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Push one serialized frame to every listed peer that lives here.
    pub fn deliver_to(&self, peer_ids: &[String], raw: &str) -> ShardOutcome {
        ShardOutcome { success: true, delivered: self.registry.deliver_to(peer_ids, raw) }
    }

    /// Push one serialized frame to every local peer of an app.
    pub fn broadcast_app(&self, app_id: &str, raw: &str) -> ShardOutcome {
        ShardOutcome { success: true, delivered: self.registry.broadcast_app(app_id, raw) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivery_counts_local_peers_only() {
        let shard = Shard::new(1);
        let (tx, mut rx) = mpsc::channel(4);
        shard.registry.register("p1", "app1", tx);

        let outcome = shard.deliver_to(&["p1".to_string(), "remote".to_string()], "{}");
        assert!(outcome.success);
        assert_eq!(outcome.delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(shard.connection_count(), 1);
    }
}
