use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (SINKR_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("SINKR_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("sinkr_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = sinkr_server::config::ServerConfig::parse();
    tracing::info!("Starting fan-out server on {}", config.listen_addr);
    if config.db_path.is_none() {
        tracing::warn!("No --db path given; state is in-memory and lost on exit");
    }
    if config.coordination_secret.is_none() {
        tracing::info!("No COORDINATION_SECRET set; internal surfaces disabled");
    }

    let server = sinkr_server::server::Server::new(config);
    server.run().await
}
