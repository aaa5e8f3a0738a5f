//! Server configuration, parsed from CLI flags with environment
//! fallbacks.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "sinkr-server", about = "Multi-tenant realtime fan-out server")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long = "listen", env = "SINKR_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// SQLite database path. Omit for a transient in-memory store.
    #[arg(long = "db", env = "SINKR_DB")]
    pub db_path: Option<String>,

    /// Soft cap on connections per worker shard; upgrade dispatch
    /// allocates a new shard once every existing one is at the cap.
    #[arg(long, env = "MAX_CONNECTIONS_PER_OBJECT", default_value_t = 500)]
    pub max_connections_per_shard: usize,

    /// Bearer token authorizing coordinator-internal WebSocket upgrades
    /// and the /internal routes. Unset disables both.
    #[arg(long, env = "COORDINATION_SECRET")]
    pub coordination_secret: Option<String>,

    /// App credentials to seed at startup, as `appId:secretKey`
    /// (repeatable). Stands in for the external tenant registry, which
    /// normally writes the shared apps table itself.
    #[arg(long = "seed-app", env = "SINKR_SEED_APPS", value_delimiter = ',')]
    pub seed_apps: Vec<String>,
}

impl ServerConfig {
    /// Config for tests: in-memory DB, ephemeral listener.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            db_path: None,
            max_connections_per_shard: 500,
            coordination_secret: None,
            seed_apps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::parse_from(["sinkr-server"]);
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
        assert_eq!(config.max_connections_per_shard, 500);
        assert!(config.db_path.is_none());
        assert!(config.seed_apps.is_empty());
    }

    #[test]
    fn seed_apps_repeatable() {
        let config = ServerConfig::parse_from([
            "sinkr-server",
            "--seed-app",
            "app1:key1",
            "--seed-app",
            "app2:key2",
        ]);
        assert_eq!(config.seed_apps, vec!["app1:key1", "app2:key2"]);
    }
}
