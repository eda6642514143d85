use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/peerchat.json";

fn default_listen_port() -> u16 {
    10000
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_db_path() -> String {
    "data/peerchat.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Keep-alive period in seconds. Must stay below `idle_timeout_secs`
    /// or connections will idle out between probes.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            keep_alive_secs: default_keep_alive_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            db_path: default_db_path(),
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"listen_port": 4001}"#).unwrap();
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.keep_alive_secs, 15);
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.db_path, "data/peerchat.db");
    }

    #[test]
    fn keep_alive_default_is_below_idle_timeout() {
        let config = AppConfig::default();
        assert!(config.keep_alive_secs < config.idle_timeout_secs);
    }
}
