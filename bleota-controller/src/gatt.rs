//! GATT endpoint abstraction
//!
//! The transfer engine talks to the device only through [`GattEndpoint`].
//! Every operation resolves once the platform reports its completion, and the
//! engine never has more than one of them outstanding on a link.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use bleota_proto::ble::{COMMAND_UUID, NOTIFY_DESCRIPTOR_UUID, RECV_FW_UUID, SERVICE_UUID};

use crate::error::{DiscoveryError, TransportError};

/// Parse UUID string into uuid::Uuid
pub(crate) fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("invalid UUID in bleota_proto")
}

/// Which of the two OTA characteristics an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    Firmware,
    Command,
}

impl std::fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CharacteristicKind::Firmware => f.write_str("firmware"),
            CharacteristicKind::Command => f.write_str("command"),
        }
    }
}

/// Resolved characteristic on the connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    pub kind: CharacteristicKind,
}

/// The OTA service with both characteristics and the ack descriptor resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    pub firmware: CharacteristicHandle,
    pub command: CharacteristicHandle,
    /// Descriptor that turns on ack notifications of the command characteristic
    pub notify_descriptor: Uuid,
}

impl ServiceDescriptor {
    pub fn handle(&self, kind: CharacteristicKind) -> &CharacteristicHandle {
        match kind {
            CharacteristicKind::Firmware => &self.firmware,
            CharacteristicKind::Command => &self.command,
        }
    }
}

/// UUIDs an endpoint looks for during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServiceLayout {
    #[serde(rename = "service_uuid")]
    pub service: Uuid,
    #[serde(rename = "firmware_char_uuid")]
    pub firmware: Uuid,
    #[serde(rename = "command_char_uuid")]
    pub command: Uuid,
}

impl Default for ServiceLayout {
    fn default() -> Self {
        Self {
            service: parse_uuid(SERVICE_UUID),
            firmware: parse_uuid(RECV_FW_UUID),
            command: parse_uuid(COMMAND_UUID),
        }
    }
}

impl ServiceLayout {
    pub fn notify_descriptor() -> Uuid {
        parse_uuid(NOTIFY_DESCRIPTOR_UUID)
    }

    /// Descriptor for a peer that exposes exactly this layout
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            service: self.service,
            firmware: CharacteristicHandle {
                service: self.service,
                uuid: self.firmware,
                kind: CharacteristicKind::Firmware,
            },
            command: CharacteristicHandle {
                service: self.service,
                uuid: self.command,
                kind: CharacteristicKind::Command,
            },
            notify_descriptor: Self::notify_descriptor(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl From<WriteMode> for btleplug::api::WriteType {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => btleplug::api::WriteType::WithResponse,
            WriteMode::WithoutResponse => btleplug::api::WriteType::WithoutResponse,
        }
    }
}

/// Link level events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { status: i32 },
    Failed(TransportError),
}

/// Raw notification payloads; the stream ends when the link goes down
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Transport primitives the engine needs from a BLE stack
#[async_trait]
pub trait GattEndpoint: Send + Sync + 'static {
    /// Fails with [`TransportError::AlreadyConnecting`] while another connect is pending
    async fn connect(&self) -> Result<(), TransportError>;

    /// Returns the MTU the link actually uses, which may be below `size`
    async fn request_mtu(&self, size: u16) -> Result<u16, TransportError>;

    async fn discover_services(&self) -> Result<ServiceDescriptor, DiscoveryError>;

    async fn enable_notifications(&self, descriptor: &ServiceDescriptor)
    -> Result<(), TransportError>;

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Subscribe before enabling notifications so no ack is missed
    async fn notifications(&self) -> Result<NotificationStream, TransportError>;

    /// Idempotent, safe in any state
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_descriptor() {
        let descriptor = ServiceLayout::default().descriptor();
        assert_eq!(
            descriptor.service.to_string(),
            "00008018-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            descriptor.handle(CharacteristicKind::Firmware).uuid.to_string(),
            "00008020-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(descriptor.command.kind, CharacteristicKind::Command);
        assert_eq!(descriptor.notify_descriptor, ServiceLayout::notify_descriptor());
    }
}
