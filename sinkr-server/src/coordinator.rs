//! Shard coordinator.
//!
//! A single logical actor per deployment, realized as a lock-protected
//! struct. Three duties: dispatch new sink connections to the
//! least-loaded worker shard under the soft cap, fan source operations
//! out across every shard that may hold relevant peers, and keep the
//! advisory load table current as shards report their counts.
//!
//! Sources and coordination-internal connections never go through
//! dispatch — they live on the coordinator's own registry (shard id 0),
//! which still participates in delivery fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::Db;
use crate::protocol::SinkFrame;
use crate::shard::{COORDINATOR_SHARD_ID, Shard, ShardOutcome};

/// Aggregate of one fan-out across all delivery targets.
#[derive(Debug, Clone, Copy)]
pub struct FanoutReport {
    pub success: bool,
    pub delivered: usize,
}

#[derive(Default)]
struct CoordinatorInner {
    /// Routable handle cache, one entry per allocated worker shard.
    shards: Vec<Arc<Shard>>,
    /// Advisory connection-count snapshot, mirrored to the persistent
    /// shard table. Dispatch reads it without locking anything else.
    loads: HashMap<i64, usize>,
}

pub struct Coordinator {
    max_connections_per_shard: usize,
    local: Arc<Shard>,
    inner: Mutex<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(max_connections_per_shard: usize) -> Self {
        Self {
            max_connections_per_shard,
            local: Arc::new(Shard::new(COORDINATOR_SHARD_ID)),
            inner: Mutex::new(CoordinatorInner::default()),
        }
    }

    /// The coordinator's own registry: source peers and internal
    /// connections. Never a dispatch target.
    pub fn local(&self) -> &Arc<Shard> {
        &self.local
    }

    /// Pick the shard a new sink connection should live on: minimum
    /// load with room under the cap, else a freshly allocated shard.
    /// The load snapshot is advisory; dispatch does not lock shards.
    pub fn assign_shard(&self, db: &Db) -> rusqlite::Result<Arc<Shard>> {
        let mut inner = self.inner.lock();
        let candidate = inner
            .shards
            .iter()
            .map(|s| (inner.loads.get(&s.id).copied().unwrap_or(0), Arc::clone(s)))
            .filter(|(load, _)| *load < self.max_connections_per_shard)
            .min_by_key(|(load, _)| *load);
        if let Some((_, shard)) = candidate {
            return Ok(shard);
        }
        let id = db.allocate_shard()?;
        tracing::info!(shard = id, "allocated worker shard");
        let shard = Arc::new(Shard::new(id));
        inner.shards.push(Arc::clone(&shard));
        inner.loads.insert(id, 0);
        Ok(shard)
    }

    /// Load report from a shard after an open or close. Updates the
    /// snapshot and best-effort persists it.
    pub fn report_load(&self, db: &Db, shard_id: i64, count: usize) {
        self.inner.lock().loads.insert(shard_id, count);
        if let Err(e) = db.update_shard_load(shard_id, count) {
            tracing::error!(shard = shard_id, error = %e, "failed to persist shard load");
        }
    }

    /// Advisory load snapshot, ordered by shard id.
    pub fn load_snapshot(&self) -> Vec<(i64, usize)> {
        let inner = self.inner.lock();
        let mut loads: Vec<(i64, usize)> = inner.loads.iter().map(|(k, v)| (*k, *v)).collect();
        loads.sort_unstable_by_key(|(id, _)| *id);
        loads
    }

    pub fn shard_count(&self) -> usize {
        self.inner.lock().shards.len()
    }

    /// Total live connections across the coordinator and every shard.
    pub fn connection_count(&self) -> usize {
        let shards = self.delivery_targets();
        shards.iter().map(|s| s.connection_count()).sum()
    }

    /// Every registry that can hold peers: the coordinator's own first,
    /// then each worker shard.
    pub fn delivery_targets(&self) -> Vec<Arc<Shard>> {
        let inner = self.inner.lock();
        let mut targets = Vec::with_capacity(inner.shards.len() + 1);
        targets.push(Arc::clone(&self.local));
        targets.extend(inner.shards.iter().cloned());
        targets
    }

    /// Fan a frame out to an explicit peer set. Every target is visited;
    /// the aggregate succeeds only if every shard serviced the
    /// operation (broadcast/channel/notification rule).
    pub fn fan_out_to_peers(&self, peer_ids: &[String], frame: &SinkFrame) -> FanoutReport {
        self.fan_out(frame, |shard, raw| shard.deliver_to(peer_ids, raw), true)
    }

    /// Fan a frame out to every live peer of an app.
    pub fn fan_out_broadcast(&self, app_id: &str, frame: &SinkFrame) -> FanoutReport {
        self.fan_out(frame, |shard, raw| shard.broadcast_app(app_id, raw), true)
    }

    /// Direct delivery: only one shard actually holds the recipient, so
    /// the aggregate succeeds if any target delivered.
    pub fn fan_out_direct(&self, peer_ids: &[String], frame: &SinkFrame) -> FanoutReport {
        self.fan_out(frame, |shard, raw| shard.deliver_to(peer_ids, raw), false)
    }

    fn fan_out<F>(&self, frame: &SinkFrame, op: F, all_must_succeed: bool) -> FanoutReport
    where
        F: Fn(&Shard, &str) -> ShardOutcome,
    {
        let raw = match serde_json::to_string(frame) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize fan-out frame");
                return FanoutReport { success: false, delivered: 0 };
            }
        };
        let outcomes: Vec<ShardOutcome> = self
            .delivery_targets()
            .iter()
            .map(|shard| op(shard, &raw))
            .collect();
        let delivered = outcomes.iter().map(|o| o.delivered).sum();
        let success = if all_must_succeed {
            outcomes.iter().all(|o| o.success)
        } else {
            outcomes.iter().any(|o| o.success && o.delivered > 0)
        };
        FanoutReport { success, delivered }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageEvent, MessageOrigin, MessagePayload, SinkFrame};
    use tokio::sync::mpsc;

    fn frame() -> SinkFrame {
        SinkFrame::message(
            "m1".into(),
            MessageEvent {
                event: "x".into(),
                from: MessageOrigin::Broadcast,
                message: MessagePayload::Plain { message: serde_json::json!(1) },
            },
        )
    }

    #[test]
    fn dispatch_prefers_least_loaded() {
        let db = Db::open_memory().unwrap();
        let coord = Coordinator::new(500);

        let s1 = coord.assign_shard(&db).unwrap();
        coord.report_load(&db, s1.id, 10);
        let s2 = coord.assign_shard(&db).unwrap();
        // s1 is under the cap but a fresh allocation only happens when
        // nothing qualifies — s1 qualifies, so no new shard yet.
        assert_eq!(s1.id, s2.id);

        coord.report_load(&db, s1.id, 500);
        let s3 = coord.assign_shard(&db).unwrap();
        assert_ne!(s3.id, s1.id);

        coord.report_load(&db, s3.id, 3);
        let s4 = coord.assign_shard(&db).unwrap();
        assert_eq!(s4.id, s3.id);
    }

    #[test]
    fn load_reports_persist() {
        let db = Db::open_memory().unwrap();
        let coord = Coordinator::new(500);
        let shard = coord.assign_shard(&db).unwrap();
        coord.report_load(&db, shard.id, 42);

        assert_eq!(coord.load_snapshot(), vec![(shard.id, 42)]);
        assert_eq!(db.shard_loads().unwrap(), vec![(shard.id, 42)]);
    }

    #[tokio::test]
    async fn broadcast_spans_local_and_shards() {
        let db = Db::open_memory().unwrap();
        let coord = Coordinator::new(500);
        let shard = coord.assign_shard(&db).unwrap();

        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        coord.local().registry.register("src", "app1", tx1);
        shard.registry.register("snk", "app1", tx2);

        let report = coord.fan_out_broadcast("app1", &frame());
        assert!(report.success);
        assert_eq!(report.delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn direct_delivery_is_any_wins() {
        let db = Db::open_memory().unwrap();
        let coord = Coordinator::new(500);
        let shard = coord.assign_shard(&db).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        shard.registry.register("p1", "app1", tx);

        let hit = coord.fan_out_direct(&["p1".to_string()], &frame());
        assert!(hit.success);
        assert_eq!(hit.delivered, 1);
        assert!(rx.try_recv().is_ok());

        let miss = coord.fan_out_direct(&["ghost".to_string()], &frame());
        assert!(!miss.success);
        assert_eq!(miss.delivered, 0);
    }
}
