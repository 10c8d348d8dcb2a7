//! Error taxonomy of the transfer engine

use std::time::Duration;

use bleota_proto::{Command, DecodeError, Message};
use uuid::Uuid;

use crate::gatt::CharacteristicKind;
use crate::machine::State;

/// Platform status reported for a successful GATT operation
pub const GATT_SUCCESS: i32 = 0;

/// Platform status used when a fault carries no status of its own
pub const GATT_FAILURE: i32 = 0x101;

/// Link closed by the peer
pub const GATT_CONN_TERMINATE_PEER_USER: i32 = 0x13;

/// Error codes for faults that never reached the platform
pub const ERROR_DISCOVERY: i32 = -2;
pub const ERROR_PROTOCOL: i32 = -3;

/// Connect/write/disconnect level fault
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("a connection attempt is already pending")]
    AlreadyConnecting,
    #[error("link is not connected")]
    NotConnected,
    #[error("gatt status {0}")]
    Status(i32),
    #[error("{0}")]
    Platform(String),
}

impl TransportError {
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Status(status) => *status,
            _ => GATT_FAILURE,
        }
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            other => TransportError::Platform(other.to_string()),
        }
    }
}

/// Missing piece of the OTA service layout
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("OTA service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("{which} characteristic {uuid} not found")]
    CharacteristicNotFound { which: CharacteristicKind, uuid: Uuid },
    #[error("notification descriptor not found on {0} characteristic")]
    DescriptorNotFound(CharacteristicKind),
    #[error("enabling notifications failed: {0}")]
    NotificationsFailed(TransportError),
    #[error("negotiated MTU {mtu} leaves no room for firmware payload")]
    MtuTooSmall { mtu: u16 },
    #[error("service discovery failed: {0}")]
    Transport(TransportError),
}

/// Ack traffic that cannot be trusted mid-transfer
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unparseable ack: {0}")]
    Unparseable(#[from] DecodeError),
    #[error("unexpected {message} while {state}")]
    UnexpectedMessage { message: Message, state: State },
    #[error("no {command} ack within {timeout:?}")]
    AckTimeout { command: Command, timeout: Duration },
}

/// Terminal failure of one transfer session
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("connect failed: {0}")]
    Connect(TransportError),
    #[error("write to {characteristic} characteristic failed at offset {offset}: {source}")]
    Write {
        characteristic: CharacteristicKind,
        offset: usize,
        source: TransportError,
    },
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("protocol error at offset {offset}: {source}")]
    Protocol { offset: usize, source: ProtocolError },
}

impl TransferError {
    /// Numeric code reported to the caller alongside the failure
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Connect(e) | TransferError::Write { source: e, .. } => e.code(),
            TransferError::Discovery(_) => ERROR_DISCOVERY,
            TransferError::Protocol { .. } => ERROR_PROTOCOL,
        }
    }

    /// Bytes the transport had accepted when the session failed
    pub fn offset(&self) -> Option<usize> {
        match self {
            TransferError::Write { offset, .. } | TransferError::Protocol { offset, .. } => {
                Some(*offset)
            }
            TransferError::Connect(_) | TransferError::Discovery(_) => None,
        }
    }
}

/// Misuse of the session controller
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("firmware image is empty")]
    EmptyImage,
    #[error("no active session")]
    NoSession,
    #[error("session is {0}, transfer needs a ready session")]
    NotReady(State),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_error_codes() {
        let err = TransferError::Write {
            characteristic: CharacteristicKind::Firmware,
            offset: 128,
            source: TransportError::Status(133),
        };
        assert_eq!(err.code(), 133);
        assert_eq!(err.offset(), Some(128));
        assert_eq!(
            err.to_string(),
            "write to firmware characteristic failed at offset 128: gatt status 133"
        );

        let err = TransferError::Connect(TransportError::AlreadyConnecting);
        assert_eq!(err.code(), GATT_FAILURE);
        assert_eq!(err.offset(), None);

        let err = TransferError::from(DiscoveryError::DescriptorNotFound(
            CharacteristicKind::Command,
        ));
        assert_eq!(err.code(), ERROR_DISCOVERY);
        assert_eq!(
            err.to_string(),
            "discovery failed: notification descriptor not found on command characteristic"
        );
    }

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::UnexpectedMessage {
            message: Message::EndAck(bleota_proto::AckStatus::Accept),
            state: State::Uploading,
        };
        assert_eq!(err.to_string(), "unexpected END_ACK(Accept) while uploading");

        let err = ProtocolError::from(DecodeError::UnknownStatus(9));
        assert_eq!(err.to_string(), "unparseable ack: unknown ack status 0x09");
    }
}
