//! Simulated DeskBike for running without a radio (`MOCK_BLE=1`).
//!
//! Emits one CSC measurement per second with both wheel and crank data: a
//! steady speed (`mock_speed_kmh`, 17.5 km/h by default) on the configured
//! wheel, and a cadence swinging between 65 and 75 rpm over a minute.

use crate::domain::csc::TICKS_PER_SECOND;
use crate::domain::models::DiscoveredDevice;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::{
    Advertisement, BleAdapter, BleError, BleLink, DisconnectCallback, GattCharacteristic,
    GattService, NotificationStream, ScanFilter, ScanStream, ServiceTable,
};
use crate::infrastructure::bluetooth::protocol::{CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID};
use async_trait::async_trait;
use futures::StreamExt;
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::{debug, info};

pub const MOCK_DEVICE_ID: &str = "mock-0";
pub const MOCK_DEVICE_NAME: &str = "DeskBike-MOCK";
pub const PACKET_INTERVAL: Duration = Duration::from_secs(1);
const CADENCE_PERIOD_STEPS: u64 = 60;

/// What the simulated rider does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockRide {
    pub speed_kmh: f64,
    pub wheel_circumference_m: f64,
}

impl MockRide {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            speed_kmh: settings.mock_speed_kmh,
            wheel_circumference_m: settings.sensor.wheel_circumference_m,
        }
    }
}

/// Running counters of the simulated sensor.
#[derive(Debug, Clone)]
pub struct MockPacketGenerator {
    ride: MockRide,
    wheel_revs: f64,
    wheel_ticks: f64,
    crank_revs: f64,
    crank_ticks: f64,
    step: u64,
}

impl MockPacketGenerator {
    pub fn new(ride: MockRide) -> Self {
        Self {
            ride,
            wheel_revs: 0.0,
            wheel_ticks: 0.0,
            crank_revs: 0.0,
            crank_ticks: 0.0,
            step: 0,
        }
    }

    fn cadence_rpm(&self) -> f64 {
        let phase = (self.step % CADENCE_PERIOD_STEPS) as f64 / CADENCE_PERIOD_STEPS as f64;
        70.0 + 5.0 * (phase * TAU).cos()
    }

    /// Advance one interval and encode the counters as a CSC measurement.
    pub fn next_packet(&mut self) -> [u8; 11] {
        let dt = PACKET_INTERVAL.as_secs_f64();
        let cadence_rpm = self.cadence_rpm();

        self.wheel_revs += self.ride.speed_kmh / 3.6 / self.ride.wheel_circumference_m * dt;
        self.wheel_ticks += dt * TICKS_PER_SECOND;
        self.crank_revs += cadence_rpm / 60.0 * dt;
        self.crank_ticks += dt * TICKS_PER_SECOND;
        self.step += 1;

        debug!(
            "Mock packet: speed={:.1}km/h cadence={:.1}rpm",
            self.ride.speed_kmh, cadence_rpm
        );

        // counters wrap like the real sensor's
        let wheel = (self.wheel_revs.round() as u64) as u32;
        let wheel_time = (self.wheel_ticks.round() as u64) as u16;
        let crank = (self.crank_revs.round() as u64) as u16;
        let crank_time = (self.crank_ticks.round() as u64) as u16;

        let mut packet = [0u8; 11];
        packet[0] = 0x03;
        packet[1..5].copy_from_slice(&wheel.to_le_bytes());
        packet[5..7].copy_from_slice(&wheel_time.to_le_bytes());
        packet[7..9].copy_from_slice(&crank.to_le_bytes());
        packet[9..11].copy_from_slice(&crank_time.to_le_bytes());
        packet
    }
}

fn mock_device() -> DiscoveredDevice {
    DiscoveredDevice::new(MOCK_DEVICE_ID, Some(MOCK_DEVICE_NAME.to_string()))
}

pub struct MockBikeAdapter {
    ride: MockRide,
}

impl MockBikeAdapter {
    pub fn new(ride: MockRide) -> Self {
        info!(
            "Mock BLE adapter active, simulating {:.1} km/h on a {:.3} m wheel",
            ride.speed_kmh, ride.wheel_circumference_m
        );
        Self { ride }
    }
}

#[async_trait]
impl BleAdapter for MockBikeAdapter {
    type Link = MockBikeLink;

    async fn scan(&self, _filter: &ScanFilter) -> Result<ScanStream, BleError> {
        let advertisement = Advertisement {
            local_name: Some(MOCK_DEVICE_NAME.to_string()),
            service_uuids: vec![CSC_SERVICE_UUID],
        };
        Ok(Box::pin(
            futures::stream::iter([(mock_device(), advertisement)])
                .chain(futures::stream::pending()),
        ))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        Ok(())
    }

    async fn resolve_address(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>, BleError> {
        Ok((address == MOCK_DEVICE_ID).then(mock_device))
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        _on_disconnect: DisconnectCallback,
    ) -> Result<MockBikeLink, BleError> {
        if device.address != MOCK_DEVICE_ID {
            return Err(BleError::DeviceNotFound(device.address.clone()));
        }
        Ok(MockBikeLink { ride: self.ride })
    }
}

pub struct MockBikeLink {
    ride: MockRide,
}

#[async_trait]
impl BleLink for MockBikeLink {
    async fn discover_services(&self) -> Result<ServiceTable, BleError> {
        Ok(ServiceTable {
            services: vec![GattService {
                uuid: CSC_SERVICE_UUID,
                characteristics: vec![GattCharacteristic {
                    service_uuid: CSC_SERVICE_UUID,
                    uuid: CSC_MEASUREMENT_UUID,
                }],
            }],
        })
    }

    async fn subscribe(
        &self,
        _characteristic: &GattCharacteristic,
    ) -> Result<NotificationStream, BleError> {
        let generator = MockPacketGenerator::new(self.ride);
        let stream = futures::stream::unfold(generator, |mut generator| async move {
            tokio::time::sleep(PACKET_INTERVAL).await;
            let packet = generator.next_packet();
            Some((packet.to_vec(), generator))
        });
        Ok(Box::pin(stream))
    }

    async fn unsubscribe(&self, _characteristic: &GattCharacteristic) -> Result<(), BleError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        Ok(())
    }
}
