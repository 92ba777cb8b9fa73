//! slbncd - multi-user IRC bouncer daemon.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use slbncd::config::Config;
use slbncd::db::Database;
use slbncd::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;

    info!(hostname = %config.server.hostname, "starting slbncd");

    let db = Database::new(&config.database.path).await?;
    let server = Server::new(config, db);
    server.run().await
}
