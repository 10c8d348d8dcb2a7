//! Transfer tunables, optionally loaded from a JSON file

use std::path::Path;
use std::time::Duration;

use bleota_proto::ble::MAX_ATT_MTU;

use crate::gatt::{ServiceLayout, WriteMode};

/// Transfer configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// ATT MTU asked for after connecting; the device may grant less
    pub requested_mtu: u16,
    /// How firmware chunks are written; commands always expect a response
    pub data_write_mode: WriteMode,
    /// How long to wait for a start/end ack before failing the session
    pub ack_timeout_ms: u64,
    #[serde(flatten)]
    pub layout: ServiceLayout,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            requested_mtu: MAX_ATT_MTU,
            data_write_mode: WriteMode::WithResponse,
            ack_timeout_ms: 10_000,
            layout: ServiceLayout::default(),
        }
    }
}

impl TransferConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: TransferConfig =
            serde_json::from_str(r#"{"requested_mtu": 247, "data_write_mode": "without_response"}"#)
                .unwrap();
        assert_eq!(config.requested_mtu, 247);
        assert_eq!(config.data_write_mode, WriteMode::WithoutResponse);
        assert_eq!(config.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.layout, ServiceLayout::default());
    }

    #[test]
    fn layout_uuids_are_flattened() {
        let config: TransferConfig = serde_json::from_str(
            r#"{"service_uuid": "0000abcd-0000-1000-8000-00805f9b34fb"}"#,
        )
        .unwrap();
        assert_eq!(
            config.layout.service.to_string(),
            "0000abcd-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(config.layout.command, ServiceLayout::default().command);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = TransferConfig::load(Path::new("/nonexistent/bleota.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
