//! BLE GATT Service Constants for firmware delivery
//!
//! Default UUIDs of the OTA service exposed by the device. Controllers may
//! override them when the firmware advertises a different layout.

/// OTA Service UUID: 00008018-0000-1000-8000-00805f9b34fb
pub const SERVICE_UUID: &str = "00008018-0000-1000-8000-00805f9b34fb";

/// Firmware Receive Characteristic UUID (write)
pub const RECV_FW_UUID: &str = "00008020-0000-1000-8000-00805f9b34fb";

/// Command Characteristic UUID (write/notify)
///
/// Start/End commands are written here and the device answers with acks
/// as notifications on the same characteristic.
pub const COMMAND_UUID: &str = "00008022-0000-1000-8000-00805f9b34fb";

/// Client Characteristic Configuration Descriptor (enables notifications)
pub const NOTIFY_DESCRIPTOR_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// ATT header bytes taken out of every characteristic write (opcode + handle)
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// ATT MTU every link starts with before negotiation
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest ATT MTU a central may request
pub const MAX_ATT_MTU: u16 = 517;
