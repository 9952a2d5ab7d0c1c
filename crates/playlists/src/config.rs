use crate::error::{Error, Result};
use engine::DiskEngineOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up under the data root when no explicit path is given
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Holds `staging/`, `bundles/` and `playlists.json`
    pub data_root: PathBuf,
    pub announce_urls: Vec<String>,
    pub piece_length: u64,
    pub policy_interval_secs: u64,
    pub rescan_interval_ms: u64,
    pub dht_enabled: bool,
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: dirs::data_dir()
                .map(|d| d.join("tapeswarm"))
                .unwrap_or_else(|| PathBuf::from("data")),
            announce_urls: vec!["udp://tracker.opentrackr.org:1337/announce".to_string()],
            piece_length: 256 * 1024,
            policy_interval_secs: 60,
            rescan_interval_ms: 2000,
            dht_enabled: true,
            listen_port: 6881,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn policy_interval(&self) -> Duration {
        Duration::from_secs(self.policy_interval_secs.max(1))
    }

    pub fn engine_options(&self) -> DiskEngineOptions {
        DiskEngineOptions {
            rescan_interval: Duration::from_millis(self.rescan_interval_ms.max(10)),
            dht_enabled: self.dht_enabled,
            listen_port: self.listen_port,
            ..Default::default()
        }
    }
}
