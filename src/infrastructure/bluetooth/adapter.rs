//! BLE Adapter Capability
//!
//! The lifecycle manager talks to the radio only through these traits, so the
//! platform stack, the mock bike and test doubles are interchangeable.

use crate::domain::models::DiscoveredDevice;
use crate::infrastructure::bluetooth::protocol::describe_uuid;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum BleError {
    #[error("BLE connect failed: {0}")]
    Connect(String),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("service discovery returned no services")]
    EmptyServiceTable,
    #[error(
        "Characteristic {uuid} was not found. Discovered characteristics: {}",
        list_or_none(.discovered)
    )]
    CharacteristicNotFound { uuid: Uuid, discovered: Vec<String> },
    #[error("timed out after {0:?} while {1}")]
    Timeout(Duration, &'static str),
    #[error("bluetooth adapter error: {0}")]
    Adapter(String),
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("connect cancelled by disconnect request")]
    Cancelled,
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Advertisement fields the scan filter looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
}

/// Which advertisements count as a target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Uuid,
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    /// Match on the advertised service, or on the name prefix when one is set.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if advertisement.service_uuids.contains(&self.service_uuid) {
            return true;
        }
        match (&self.name_prefix, &advertisement.local_name) {
            (Some(prefix), Some(name)) if !prefix.is_empty() => name
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
            _ => false,
        }
    }
}

/// Handle to a characteristic inside a discovered service table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattCharacteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Result of GATT service discovery. May be empty right after link setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    pub services: Vec<GattService>,
}

impl ServiceTable {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Direct lookup of a characteristic inside one service.
    pub fn get_characteristic(
        &self,
        service_uuid: &Uuid,
        uuid: &Uuid,
    ) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .filter(|s| &s.uuid == service_uuid)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| &c.uuid == uuid)
    }

    /// Enumerate every characteristic of every service.
    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics().find(|c| &c.uuid == uuid)
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &GattCharacteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    /// `service/characteristic` identifiers, sorted and deduplicated.
    pub fn describe(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .characteristics()
            .map(|c| format!("{}/{}", describe_uuid(&c.service_uuid), describe_uuid(&c.uuid)))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

pub type ScanStream = Pin<Box<dyn Stream<Item = (DiscoveredDevice, Advertisement)> + Send>>;
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Invoked by the adapter when the link drops. May be called more than once.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    type Link: BleLink;

    /// Start discovery. The stream stays open until [`BleAdapter::stop_scan`]
    /// is called or the stream is dropped.
    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Look a device up by address without a prior scan.
    ///
    /// Bounded by `timeout`. Any discovery started for the lookup must be
    /// stopped before this returns.
    async fn resolve_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>, BleError>;

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        on_disconnect: DisconnectCallback,
    ) -> Result<Self::Link, BleError>;
}

#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    async fn discover_services(&self) -> Result<ServiceTable, BleError>;

    async fn subscribe(
        &self,
        characteristic: &GattCharacteristic,
    ) -> Result<NotificationStream, BleError>;

    async fn unsubscribe(&self, characteristic: &GattCharacteristic) -> Result<(), BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;
}
