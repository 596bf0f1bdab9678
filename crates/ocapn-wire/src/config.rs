//! Node configuration loaded from `~/.ocapn/config.toml` with defaults.

use ocapn_types::Encoding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Maximum buffered size of a single incoming message (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// CapTP protocol version spoken in `op:start-session`.
pub const CAPTP_VERSION: &str = "1.0";

/// Configuration for an [`OcapnNode`](crate::node::OcapnNode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to bind the TCP listener on.
    pub listen_addr: SocketAddr,
    /// Human-readable label used in logs.
    pub designator: String,
    pub captp_version: String,
    /// Wire encoding used for every session of this node.
    pub encoding: Encoding,
    pub max_message_size: usize,
    /// How long `provide_session` waits for a handshake to complete.
    pub handshake_timeout_secs: u64,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
    /// Swissnum to greeting text for the demo objects served by the binary.
    pub sturdyrefs: BTreeMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            designator: "ocapn".to_string(),
            captp_version: CAPTP_VERSION.to_string(),
            encoding: Encoding::Syrup,
            max_message_size: MAX_MESSAGE_SIZE,
            handshake_timeout_secs: 10,
            log_json: false,
            sturdyrefs: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Load node configuration from a TOML file, with defaults.
///
/// A missing or unreadable file is not an error: the defaults are used and
/// the problem is logged.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    ocapn_home().join("config.toml")
}

/// Get the OCapN home directory (`~/.ocapn`).
pub fn ocapn_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ocapn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/ocapn/config.toml")));
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.captp_version, "1.0");
        assert_eq!(config.encoding, Encoding::Syrup);
    }

    #[test]
    fn test_load_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
listen_addr = "127.0.0.1:4444"
encoding = "cbor"

[sturdyrefs]
greeter = "hello"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.listen_addr.port(), 4444);
        assert_eq!(config.encoding, Encoding::Cbor);
        assert_eq!(config.designator, "ocapn");
        assert_eq!(config.sturdyrefs.get("greeter").map(String::as_str), Some("hello"));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_load_config_invalid_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen_addr = [not valid").unwrap();
        assert_eq!(load_config(Some(&path)), NodeConfig::default());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".ocapn/config.toml"));
    }
}
