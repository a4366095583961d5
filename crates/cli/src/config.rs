//! Per-directory configuration file parsing (.blocksync.toml)

use std::path::Path;

/// Defaults for a sync base directory, overridden by CLI flags
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Coordinator address, e.g. "127.0.0.1:9090"
    pub server: Option<String>,

    /// Block size in bytes; must match the server's
    pub block_size: Option<u32>,
}

/// Config file name inside the base directory
pub const CONFIG_FILE: &str = ".blocksync.toml";

impl SyncConfig {
    /// Load config from the base directory.
    ///
    /// Returns the default config if .blocksync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(base_dir: &Path) -> color_eyre::Result<Self> {
        let config_path = base_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
