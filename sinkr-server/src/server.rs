//! Shared server state and startup.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::db::Db;
use crate::protocol::RouteError;
use crate::shard::{COORDINATOR_SHARD_ID, Shard};

/// State shared by every connection handler, the coordinator, and the
/// HTTP surface.
pub struct SharedState {
    pub config: ServerConfig,
    pub db: Mutex<Db>,
    pub coordinator: Coordinator,
    started_at: Instant,
}

impl SharedState {
    /// Open the store, reap any leftovers from a previous process, seed
    /// configured apps, and build the coordinator.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let db = match config.db_path.as_deref() {
            Some(path) => Db::open(path).with_context(|| format!("opening database {path}"))?,
            None => Db::open_memory().context("opening in-memory database")?,
        };

        // Peer rows exist iff their socket is live; after a restart none
        // are, and stale shard counts would skew dispatch.
        let reaped = db.clear_peers().context("reaping stale peers")?;
        if reaped > 0 {
            tracing::info!(peers = reaped, "reaped stale peer rows from previous run");
        }
        db.reset_shard_loads().context("resetting shard loads")?;

        for entry in &config.seed_apps {
            match entry.split_once(':') {
                Some((id, secret)) if !id.is_empty() && !secret.is_empty() => {
                    db.upsert_app(id, id, secret, true)?;
                    tracing::info!(app = id, "seeded app");
                }
                _ => tracing::warn!(entry, "ignoring malformed --seed-app (want appId:secretKey)"),
            }
        }

        let coordinator = Coordinator::new(config.max_connections_per_shard);
        Ok(Arc::new(Self {
            config,
            db: Mutex::new(db),
            coordinator,
            started_at: Instant::now(),
        }))
    }

    /// Run a closure against the store. Store failures are logged and
    /// surfaced to the caller as the wire-level `Unknown error` — a
    /// request must never observe a raw database error.
    pub fn with_db<F, R>(&self, f: F) -> Result<R, RouteError>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        f(&db).map_err(|e| {
            tracing::error!(error = %e, "database error");
            RouteError::Unknown
        })
    }

    /// Report a worker shard's connection count to the coordinator.
    /// The coordinator's own registry (shard 0) is not load-accounted.
    pub fn report_shard_load(&self, shard: &Shard) {
        if shard.id == COORDINATOR_SHARD_ID {
            return;
        }
        let db = self.db.lock();
        self.coordinator.report_load(&db, shard.id, shard.connection_count());
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// The server binary's entry object: builds state and serves the router.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let state = SharedState::new(self.config)?;
        let listener = tokio::net::TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", state.config.listen_addr))?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        let app = crate::web::router(state);
        axum::serve(listener, app).await.context("serving")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PeerKind;

    #[test]
    fn seed_apps_parsed() {
        let mut config = ServerConfig::for_tests();
        config.seed_apps = vec!["app1:key1".into(), "garbage".into()];
        let state = SharedState::new(config).unwrap();

        let app = state.with_db(|db| db.get_app("app1")).unwrap().unwrap();
        assert_eq!(app.secret_key, "key1");
        assert!(state.with_db(|db| db.get_app("garbage")).unwrap().is_none());
    }

    #[test]
    fn boot_reaps_peers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sinkr.db");
        {
            let db = Db::open(&path).unwrap();
            db.upsert_app("app1", "app1", "k", true).unwrap();
            db.insert_peer("ghost", "app1", PeerKind::Sink).unwrap();
        }

        let mut config = ServerConfig::for_tests();
        config.db_path = Some(path.to_string_lossy().to_string());
        let state = SharedState::new(config).unwrap();
        assert!(state.with_db(|db| db.get_peer("app1", "ghost")).unwrap().is_none());
    }
}
