//! Server commands: `harvest serve` and `harvest init-db`.

use std::path::Path;

use anyhow::{Context, Result};
use harvest::config::HarvestConfig;
use harvest::server::{ServerConfig, start_server};
use harvest::store::HarvestDb;

pub async fn cmd_serve(config: &HarvestConfig, permissive_cors: bool) -> Result<()> {
    for warning in config.toml.validate() {
        tracing::warn!(%warning, "configuration warning");
    }
    let server = ServerConfig {
        permissive_cors,
        ..ServerConfig::from(&config.toml.server)
    };
    start_server(server, &config.toml).await
}

pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    HarvestDb::new(db_path)?;
    println!("Harvest database initialized at {}", db_path.display());
    Ok(())
}
