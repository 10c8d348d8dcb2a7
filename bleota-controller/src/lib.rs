//! BLE OTA Controller
//!
//! Delivers a firmware image to a device over a GATT link. Every protocol
//! step (start, each data chunk, end) waits for its acknowledgement before
//! the next one is issued, so the device never sees overlapping writes.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bleota_controller::{ble, BtleplugEndpoint, FirmwareImage, OtaClient, SessionEvent, TransferConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransferConfig::default();
//!     let adapter = ble::get_adapter().await?;
//!     let device = ble::find_device(&adapter, None, config.layout.service, Duration::from_secs(5)).await?;
//!     let endpoint = Arc::new(BtleplugEndpoint::new(adapter, device, config.layout));
//!
//!     let mut client = OtaClient::new(endpoint, config);
//!     let image = FirmwareImage::new(std::fs::read("app.bin")?)?;
//!     client.connect(image, |event: SessionEvent| println!("{event:?}")).await;
//!     // wait for SessionEvent::Ready, then
//!     client.ota()?;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod gatt;
pub mod image;
pub mod machine;
pub mod mock;
pub mod router;
pub mod session;

pub use ble::BtleplugEndpoint;
pub use config::{ConfigError, TransferConfig};
pub use error::{DiscoveryError, ProtocolError, SessionError, TransferError, TransportError};
pub use gatt::{
    CharacteristicHandle, CharacteristicKind, ConnectionEvent, GattEndpoint, NotificationStream,
    ServiceDescriptor, ServiceLayout, WriteMode,
};
pub use image::FirmwareImage;
pub use machine::{Outcome, SessionEvent, Snapshot, State, TransferMachine};
pub use session::{Observer, OtaClient};
