//! Gateway configuration.
//!
//! One YAML file configures the serving side: listen addresses, the idle
//! deadline, the identification table and the path to the protocol
//! definition. Every field has a default so a minimal deployment config can
//! stay minimal. Merge rules across multiple files are intentionally not
//! part of the gateway.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::server::IdentityTable;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// TCP listen address.
    pub listen: String,
    /// Optional UDP ingest address.
    pub udp_listen: Option<String>,
    /// Path to the protocol definition file.
    pub protocol: PathBuf,
    /// Idle read deadline per frame iteration, in seconds.
    pub idle_timeout_secs: u64,
    /// Reject connections from addresses without a device alias.
    pub require_alias: bool,
    /// Remote IP to device alias table.
    pub devices: HashMap<String, String>,
    /// Capacity of the bounded emission channel.
    pub queue_capacity: usize,
    /// Optional cap on concurrent connections; beyond it, accepts are
    /// rejected rather than queued.
    pub max_connections: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7200".to_string(),
            udp_listen: None,
            protocol: PathBuf::from("protocol.yaml"),
            idle_timeout_secs: 60,
            require_alias: false,
            devices: HashMap::new(),
            queue_capacity: 256,
            max_connections: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|err| GatewayError::config(path, err))?;
        serde_yaml_ng::from_str(&text).map_err(|err| GatewayError::config(path, err))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn identity_table(&self) -> IdentityTable {
        IdentityTable::new(self.devices.clone(), self.require_alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_field() {
        let config: GatewayConfig = serde_yaml_ng::from_str("listen: 0.0.0.0:9000").unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.queue_capacity, 256);
        assert!(!config.require_alias);
        assert!(config.udp_listen.is_none());
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn load_reads_a_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
listen: 127.0.0.1:7200
udp_listen: 127.0.0.1:7201
protocol: deploy/vobc.yaml
idle_timeout_secs: 30
require_alias: true
devices:
  10.0.0.2: vobc1
  10.0.0.3: vobc2
queue_capacity: 64
max_connections: 128
"#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.udp_listen.as_deref(), Some("127.0.0.1:7201"));
        assert_eq!(config.protocol, PathBuf::from("deploy/vobc.yaml"));
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert!(config.require_alias);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.max_connections, Some(128));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = GatewayConfig::load("/nonexistent/gateway.yaml").unwrap_err();
        assert!(err.is_startup_fatal());
        assert!(err.to_string().contains("gateway.yaml"));
    }
}
