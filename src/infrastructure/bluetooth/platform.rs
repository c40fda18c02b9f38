//! btleplug-backed adapter
//!
//! BlueZ on Linux, WinRT on Windows, CoreBluetooth on macOS. Devices are
//! identified by their MAC address, or by the platform UUID where the OS hides
//! the address (macOS reports `00:00:00:00:00:00`).

use crate::domain::models::DiscoveredDevice;
use crate::infrastructure::bluetooth::adapter::{
    Advertisement, BleAdapter, BleError, BleLink, DisconnectCallback, GattCharacteristic,
    GattService, NotificationStream, ScanFilter, ScanStream, ServiceTable,
};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as PlatformScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        BleError::Adapter(e.to_string())
    }
}

/// Stable identifier handed to the parent process as `device_id`.
fn identifier(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Open the platform manager and pick an adapter.
    ///
    /// `adapter_name` is matched against the adapter info string (for BlueZ it
    /// contains the `hciN` name). Without it the first adapter is used.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(BleError::NoAdapter);
        }

        let mut selected = None;
        let mut seen = Vec::new();
        for adapter in adapters {
            let info = adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            let wanted = match adapter_name {
                Some(name) => info.contains(name),
                None => true,
            };
            if wanted && selected.is_none() {
                selected = Some((adapter, info));
            } else {
                seen.push(info);
            }
        }

        let (adapter, info) = selected.ok_or_else(|| {
            BleError::Adapter(format!(
                "adapter {:?} not found (available: {})",
                adapter_name.unwrap_or_default(),
                seen.join(", ")
            ))
        })?;
        info!("Using Bluetooth adapter {}", info);

        #[cfg(target_os = "macos")]
        Self::wait_powered_on(&adapter).await;

        Ok(Self { adapter })
    }

    /// CoreBluetooth ignores scan requests until the manager is powered on.
    #[cfg(target_os = "macos")]
    async fn wait_powered_on(adapter: &Adapter) {
        use btleplug::api::CentralState;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => break,
                Ok(state) if tokio::time::Instant::now() < deadline => {
                    debug!("Adapter state {:?}, waiting", state);
                }
                Ok(state) => {
                    warn!("Adapter still {:?} after 3 s, continuing", state);
                    break;
                }
                Err(e) => {
                    warn!("Could not read adapter state: {}", e);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, BleError> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals
            .into_iter()
            .find(|p| identifier(p).eq_ignore_ascii_case(address)))
    }

    async fn describe(peripheral: &Peripheral) -> DiscoveredDevice {
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|props| props.local_name);
        DiscoveredDevice::new(identifier(peripheral), name)
    }

    async fn watch_disconnect(
        &self,
        id: PeripheralId,
        on_disconnect: DisconnectCallback,
    ) -> Option<JoinHandle<()>> {
        match self.adapter.events().await {
            Ok(mut events) => Some(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(lost) = event {
                        if lost == id {
                            info!("Disconnect watcher: device {:?} disconnected", lost);
                            on_disconnect();
                            break;
                        }
                    }
                }
            })),
            Err(e) => {
                warn!("Disconnect watcher: could not subscribe to adapter events: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    type Link = BtleplugLink;

    async fn scan(&self, _filter: &ScanFilter) -> Result<ScanStream, BleError> {
        let events = self.adapter.events().await?;
        // some stacks drop name-only advertisements under a service filter,
        // so every advertisement is reported and filtered by the caller
        self.adapter
            .start_scan(PlatformScanFilter::default())
            .await?;

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok()??;
                let device = DiscoveredDevice::new(identifier(&peripheral), props.local_name.clone());
                Some((
                    device,
                    Advertisement {
                        local_name: props.local_name,
                        service_uuids: props.services,
                    },
                ))
            }
        });
        Ok(Box::pin(stream))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn resolve_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>, BleError> {
        if let Some(peripheral) = self.find_peripheral(address).await? {
            return Ok(Some(Self::describe(&peripheral).await));
        }

        self.adapter
            .start_scan(PlatformScanFilter::default())
            .await?;
        let found = tokio::time::timeout(timeout, async {
            loop {
                if let Ok(Some(peripheral)) = self.find_peripheral(address).await {
                    return peripheral;
                }
                tokio::time::sleep(RESOLVE_POLL_INTERVAL).await;
            }
        })
        .await
        .ok();
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan after address lookup failed: {}", e);
        }

        match found {
            Some(peripheral) => Ok(Some(Self::describe(&peripheral).await)),
            None => Ok(None),
        }
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        on_disconnect: DisconnectCallback,
    ) -> Result<BtleplugLink, BleError> {
        let peripheral = self
            .find_peripheral(&device.address)
            .await?
            .ok_or_else(|| BleError::DeviceNotFound(device.address.clone()))?;

        peripheral
            .connect()
            .await
            .map_err(|e| BleError::Connect(e.to_string()))?;

        let watcher = self.watch_disconnect(peripheral.id(), on_disconnect).await;
        Ok(BtleplugLink {
            peripheral,
            watcher,
        })
    }
}

pub struct BtleplugLink {
    peripheral: Peripheral,
    watcher: Option<JoinHandle<()>>,
}

impl BtleplugLink {
    fn platform_characteristic(
        &self,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic, BleError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
            })
            .ok_or_else(|| BleError::CharacteristicNotFound {
                uuid: characteristic.uuid,
                discovered: Vec::new(),
            })
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn discover_services(&self) -> Result<ServiceTable, BleError> {
        self.peripheral.discover_services().await?;
        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        service_uuid: c.service_uuid,
                        uuid: c.uuid,
                    })
                    .collect(),
            })
            .collect();
        Ok(ServiceTable { services })
    }

    async fn subscribe(
        &self,
        characteristic: &GattCharacteristic,
    ) -> Result<NotificationStream, BleError> {
        let target = self.platform_characteristic(characteristic)?;
        // open the stream first so the first notification is not lost
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;

        let uuid = target.uuid;
        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| n.value);
        Ok(Box::pin(stream))
    }

    async fn unsubscribe(&self, characteristic: &GattCharacteristic) -> Result<(), BleError> {
        let target = self.platform_characteristic(characteristic)?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
