//! Scripted in-memory OTA device
//!
//! Speaks the default tagged framing, records every write and flags any
//! write issued while another one is still outstanding.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use bleota_proto::{AckStatus, FrameCodec, Message, TaggedCodec};

use crate::error::{DiscoveryError, TransportError};
use crate::gatt::{
    CharacteristicHandle, CharacteristicKind, GattEndpoint, NotificationStream, ServiceDescriptor,
    ServiceLayout, WriteMode,
};

const LINK_LOSS_WRITE_DELAY: Duration = Duration::from_millis(20);

/// Part of the OTA service the mock pretends not to have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingElement {
    Service,
    FirmwareCharacteristic,
    CommandCharacteristic,
    NotifyDescriptor,
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub layout: ServiceLayout,
    /// Largest MTU the device grants; `None` grants whatever is requested
    pub max_mtu: Option<u16>,
    pub mtu_status: Option<i32>,
    pub connect_status: Option<i32>,
    pub connect_delay: Duration,
    pub missing: Option<MissingElement>,
    pub notify_status: Option<i32>,
    /// `None` never answers the command
    pub start_ack: Option<AckStatus>,
    pub end_ack: Option<AckStatus>,
    /// Sent instead of the encoded start ack
    pub raw_start_ack: Option<Vec<u8>>,
    /// Sent instead of the encoded end ack
    pub raw_end_ack: Option<Vec<u8>>,
    /// Zero-based write index and the status it fails with
    pub fail_write: Option<(usize, i32)>,
    pub write_delay: Duration,
    /// Zero-based write during which the link drops; that write then fails
    pub drop_link_on_write: Option<usize>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            layout: ServiceLayout::default(),
            max_mtu: None,
            mtu_status: None,
            connect_status: None,
            connect_delay: Duration::ZERO,
            missing: None,
            notify_status: None,
            start_ack: Some(AckStatus::Accept),
            end_ack: Some(AckStatus::Accept),
            raw_start_ack: None,
            raw_end_ack: None,
            fail_write: None,
            write_delay: Duration::ZERO,
            drop_link_on_write: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub characteristic: CharacteristicKind,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

#[derive(Default)]
struct MockState {
    connecting: bool,
    connected: bool,
    notifications_enabled: bool,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writes: Vec<RecordedWrite>,
    write_in_flight: bool,
    overlapped: bool,
    firmware: Vec<u8>,
    disconnects: usize,
}

impl MockState {
    fn notify(&self, data: Vec<u8>) {
        if !self.notifications_enabled {
            return;
        }
        if let Some(tx) = &self.notify_tx {
            let _ = tx.send(data);
        }
    }

    fn drop_link(&mut self) {
        self.connected = false;
        self.notifications_enabled = false;
        self.notify_tx = None;
    }
}

pub struct MockDevice {
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Payload of every write to the firmware characteristic, in order
    pub fn firmware_writes(&self) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.characteristic == CharacteristicKind::Firmware)
            .map(|w| w.data.clone())
            .collect()
    }

    /// Firmware bytes whose writes completed successfully
    pub fn received_firmware(&self) -> Vec<u8> {
        self.state().firmware.clone()
    }

    /// True if a write was ever issued before the previous one completed
    pub fn overlapped(&self) -> bool {
        self.state().overlapped
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    /// Simulates the peer going out of range
    pub fn drop_link(&self) {
        self.state().drop_link();
    }

    fn reply_to(&self, data: &[u8]) -> Option<Vec<u8>> {
        match TaggedCodec.decode(data) {
            Ok(Message::Start) => self.behavior.raw_start_ack.clone().or_else(|| {
                self.behavior
                    .start_ack
                    .map(|status| Message::StartAck(status).to_bytes())
            }),
            Ok(Message::End) => self.behavior.raw_end_ack.clone().or_else(|| {
                self.behavior
                    .end_ack
                    .map(|status| Message::EndAck(status).to_bytes())
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl GattEndpoint for MockDevice {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            if state.connecting {
                return Err(TransportError::AlreadyConnecting);
            }
            state.connecting = true;
        }

        if !self.behavior.connect_delay.is_zero() {
            tokio::time::sleep(self.behavior.connect_delay).await;
        }

        let mut state = self.state();
        state.connecting = false;
        if let Some(status) = self.behavior.connect_status {
            return Err(TransportError::Status(status));
        }
        state.connected = true;
        Ok(())
    }

    async fn request_mtu(&self, size: u16) -> Result<u16, TransportError> {
        if !self.state().connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(status) = self.behavior.mtu_status {
            return Err(TransportError::Status(status));
        }
        Ok(self.behavior.max_mtu.map_or(size, |max| size.min(max)))
    }

    async fn discover_services(&self) -> Result<ServiceDescriptor, DiscoveryError> {
        if !self.state().connected {
            return Err(DiscoveryError::Transport(TransportError::NotConnected));
        }

        let layout = self.behavior.layout;
        match self.behavior.missing {
            None => Ok(layout.descriptor()),
            Some(MissingElement::Service) => Err(DiscoveryError::ServiceNotFound(layout.service)),
            Some(MissingElement::FirmwareCharacteristic) => {
                Err(DiscoveryError::CharacteristicNotFound {
                    which: CharacteristicKind::Firmware,
                    uuid: layout.firmware,
                })
            }
            Some(MissingElement::CommandCharacteristic) => {
                Err(DiscoveryError::CharacteristicNotFound {
                    which: CharacteristicKind::Command,
                    uuid: layout.command,
                })
            }
            Some(MissingElement::NotifyDescriptor) => Err(DiscoveryError::DescriptorNotFound(
                CharacteristicKind::Command,
            )),
        }
    }

    async fn enable_notifications(
        &self,
        _descriptor: &ServiceDescriptor,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(status) = self.behavior.notify_status {
            return Err(TransportError::Status(status));
        }
        state.notifications_enabled = true;
        Ok(())
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let index = {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if state.write_in_flight {
                state.overlapped = true;
            }
            state.write_in_flight = true;
            state.writes.push(RecordedWrite {
                characteristic: characteristic.kind,
                data: data.to_vec(),
                mode,
            });
            state.writes.len() - 1
        };

        if !self.behavior.write_delay.is_zero() {
            tokio::time::sleep(self.behavior.write_delay).await;
        }

        if self.behavior.drop_link_on_write == Some(index) {
            self.state().drop_link();
            // The host reports the disconnect before failing the write
            tokio::time::sleep(LINK_LOSS_WRITE_DELAY).await;
            self.state().write_in_flight = false;
            return Err(TransportError::NotConnected);
        }

        let mut state = self.state();
        state.write_in_flight = false;
        if let Some((at, status)) = self.behavior.fail_write {
            if at == index {
                return Err(TransportError::Status(status));
            }
        }

        match characteristic.kind {
            CharacteristicKind::Firmware => state.firmware.extend_from_slice(data),
            CharacteristicKind::Command => {
                if let Some(reply) = self.reply_to(data) {
                    state.notify(reply);
                }
            }
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().notify_tx = Some(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| (data, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) {
        let mut state = self.state();
        state.drop_link();
        state.disconnects += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_connect_while_pending_is_rejected() {
        let device = std::sync::Arc::new(MockDevice::new(MockBehavior {
            connect_delay: Duration::from_millis(50),
            ..Default::default()
        }));

        let first = tokio::spawn({
            let device = device.clone();
            async move { device.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(device.connect().await, Err(TransportError::AlreadyConnecting));
        assert_eq!(first.await.unwrap(), Ok(()));
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn grants_at_most_max_mtu() {
        let device = MockDevice::new(MockBehavior {
            max_mtu: Some(185),
            ..Default::default()
        });
        assert_eq!(device.request_mtu(517).await, Err(TransportError::NotConnected));
        device.connect().await.unwrap();
        assert_eq!(device.request_mtu(517).await, Ok(185));
        assert_eq!(device.request_mtu(100).await, Ok(100));
    }

    #[tokio::test]
    async fn acks_start_command_once_notifications_are_on() {
        let device = MockDevice::new(MockBehavior::default());
        device.connect().await.unwrap();
        let mut notifications = device.notifications().await.unwrap();
        let descriptor = device.discover_services().await.unwrap();
        device.enable_notifications(&descriptor).await.unwrap();

        device
            .write_characteristic(&descriptor.command, &[0x01], WriteMode::WithResponse)
            .await
            .unwrap();
        assert_eq!(notifications.next().await, Some(vec![0x81, 0x00]));

        device.disconnect().await;
        assert_eq!(notifications.next().await, None);
        assert!(!device.is_connected());
        assert_eq!(device.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn reports_missing_descriptor() {
        let device = MockDevice::new(MockBehavior {
            missing: Some(MissingElement::NotifyDescriptor),
            ..Default::default()
        });
        device.connect().await.unwrap();
        assert_eq!(
            device.discover_services().await,
            Err(DiscoveryError::DescriptorNotFound(CharacteristicKind::Command))
        );
    }
}
