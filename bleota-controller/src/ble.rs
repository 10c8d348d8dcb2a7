//! `btleplug` binding of the GATT endpoint
//!
//! Locates an already-advertising device and exposes it as a [`GattEndpoint`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{StreamExt, future, stream};
use log::{debug, info, warn};
use uuid::Uuid;

use bleota_proto::ble::DEFAULT_ATT_MTU;

use crate::error::{DiscoveryError, TransportError};
use crate::gatt::{
    CharacteristicHandle, CharacteristicKind, GattEndpoint, NotificationStream, ServiceDescriptor,
    ServiceLayout, WriteMode,
};

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Platform("no Bluetooth adapter found".to_string()))
}

/// Find a device by name/address pattern, or any device advertising the OTA service
pub async fn find_device(
    adapter: &Adapter,
    target: Option<&str>,
    service: Uuid,
    scan_for: Duration,
) -> Result<Peripheral, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(scan_for).await;

    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_default();
            let addr = peripheral.address().to_string();

            let matches = match target {
                Some(t) => name.contains(t) || addr.contains(t),
                None => props.services.contains(&service),
            };

            if matches {
                adapter.stop_scan().await?;
                info!("found device {name} ({addr})");
                return Ok(peripheral);
            }
        }
    }

    adapter.stop_scan().await?;
    Err(TransportError::Platform("no matching OTA device found".to_string()))
}

/// MTU reported for a request when the exchange itself is not observable
fn assumed_mtu(requested: u16, link_mtu: u16) -> u16 {
    requested.min(link_mtu)
}

/// GATT endpoint over a `btleplug` peripheral
pub struct BtleplugEndpoint {
    adapter: Adapter,
    peripheral: Peripheral,
    layout: ServiceLayout,
    link_mtu: u16,
    connecting: AtomicBool,
}

impl BtleplugEndpoint {
    pub fn new(adapter: Adapter, peripheral: Peripheral, layout: ServiceLayout) -> Self {
        Self {
            adapter,
            peripheral,
            layout,
            link_mtu: DEFAULT_ATT_MTU,
            connecting: AtomicBool::new(false),
        }
    }

    /// MTU the host stack is known to settle on for this link
    ///
    /// Host stacks run the MTU exchange themselves and `btleplug` does not
    /// report its result, so requests are capped at this value. Defaults to
    /// the ATT minimum of 23, which every peer supports.
    pub fn with_link_mtu(mut self, mtu: u16) -> Self {
        self.link_mtu = mtu;
        self
    }

    fn characteristic(
        &self,
        handle: &CharacteristicHandle,
    ) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl GattEndpoint for BtleplugEndpoint {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyConnecting);
        }

        let result = async {
            if !self.peripheral.is_connected().await? {
                self.peripheral.connect().await?;
            }
            Ok::<(), TransportError>(())
        }
        .await;

        self.connecting.store(false, Ordering::Release);
        result
    }

    async fn request_mtu(&self, size: u16) -> Result<u16, TransportError> {
        let mtu = assumed_mtu(size, self.link_mtu);
        warn!("MTU exchange is not exposed by the host stack, assuming {mtu} (requested {size})");
        Ok(mtu)
    }

    async fn discover_services(&self) -> Result<ServiceDescriptor, DiscoveryError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| DiscoveryError::Transport(e.into()))?;

        let services = self.peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == self.layout.service)
            .ok_or(DiscoveryError::ServiceNotFound(self.layout.service))?;

        let find = |which: CharacteristicKind, uuid: Uuid| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .ok_or(DiscoveryError::CharacteristicNotFound { which, uuid })
        };
        let firmware = find(CharacteristicKind::Firmware, self.layout.firmware)?;
        let command = find(CharacteristicKind::Command, self.layout.command)?;

        // Some platforms hide the CCCD, the notify property implies it
        let notify_descriptor = ServiceLayout::notify_descriptor();
        let notifiable = command.descriptors.iter().any(|d| d.uuid == notify_descriptor)
            || command
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE);
        if !notifiable {
            return Err(DiscoveryError::DescriptorNotFound(CharacteristicKind::Command));
        }

        debug!(
            "firmware characteristic {:?}, command characteristic {:?}",
            firmware.properties, command.properties
        );
        Ok(self.layout.descriptor())
    }

    async fn enable_notifications(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<(), TransportError> {
        let command = self.characteristic(&descriptor.command)?;
        self.peripheral.subscribe(&command).await?;
        Ok(())
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.write(&target, data, mode.into()).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let command = self.layout.command;
        let values = self
            .peripheral
            .notifications()
            .await?
            .filter_map(move |n| future::ready((n.uuid == command).then_some(Some(n.value))));

        let id = self.peripheral.id();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            let lost = matches!(&event, CentralEvent::DeviceDisconnected(peer) if *peer == id);
            future::ready(lost.then_some(None))
        });

        Ok(stream::select(values, disconnects)
            .take_while(|item| future::ready(item.is_some()))
            .filter_map(future::ready)
            .boxed())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("disconnect: {e}");
        }
    }
}
