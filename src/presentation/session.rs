use crate::domain::csc::CscDecoder;
use crate::domain::models::{AppEvent, ConnectionPhase};
use crate::domain::settings::{SensorSettings, TelemetrySettings};
use crate::presentation::boundary::BoundaryEvent;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Turns lifecycle events into boundary events.
///
/// Owns the decoder for the process lifetime and resets it on every new
/// subscription. Notifications are only decoded while the session is live
/// and the manager still reports `Subscribed`.
pub struct TelemetrySession {
    decoder: CscDecoder,
    live: bool,
    emit_raw: bool,
    min_interval: Option<Duration>,
    last_sample: Option<Instant>,
    phase: watch::Receiver<ConnectionPhase>,
}

impl TelemetrySession {
    pub fn new(
        sensor: &SensorSettings,
        telemetry: &TelemetrySettings,
        phase: watch::Receiver<ConnectionPhase>,
    ) -> Self {
        let rate = telemetry.max_samples_per_sec;
        // a rate too small for a Duration never lets a second sample through
        let min_interval = (rate.is_finite() && rate > 0.0)
            .then(|| Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX));
        Self {
            decoder: CscDecoder::new(
                sensor.wheel_circumference_m,
                sensor.reset_distance_on_reconnect,
            ),
            live: false,
            emit_raw: telemetry.emit_raw,
            min_interval,
            last_sample: None,
            phase,
        }
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.live
    }

    #[cfg(test)]
    pub fn decoder(&self) -> &CscDecoder {
        &self.decoder
    }

    pub fn handle(&mut self, event: AppEvent) -> Vec<BoundaryEvent> {
        self.handle_at(event, Instant::now())
    }

    pub fn handle_at(&mut self, event: AppEvent, now: Instant) -> Vec<BoundaryEvent> {
        match event {
            AppEvent::DeviceFound(device) => vec![BoundaryEvent::Device {
                name: device.display_name().to_string(),
                id: device.address,
            }],
            AppEvent::Connected => {
                self.decoder.reset();
                self.live = true;
                self.last_sample = None;
                vec![BoundaryEvent::Connected]
            }
            AppEvent::Notification(raw) => self.on_notification(raw, now),
            AppEvent::Disconnected => {
                self.live = false;
                vec![BoundaryEvent::Disconnected]
            }
            AppEvent::Error(message) => {
                self.live = false;
                vec![BoundaryEvent::Error { message }]
            }
        }
    }

    fn on_notification(&mut self, raw: Vec<u8>, now: Instant) -> Vec<BoundaryEvent> {
        if !self.live || *self.phase.borrow() != ConnectionPhase::Subscribed {
            trace!("Dropping notification outside a live session");
            return Vec::new();
        }

        let decoded = self.decoder.decode(&raw);
        let mut out = Vec::with_capacity(2);
        if self.emit_raw {
            out.push(BoundaryEvent::Data { raw });
        }

        match decoded {
            Ok(sample) if !sample.is_empty() && self.sample_due(now) => {
                self.last_sample = Some(now);
                out.push(BoundaryEvent::Telemetry {
                    cadence_rpm: sample.cadence_rpm,
                    speed_kmh: sample.speed_kmh,
                    distance_km: sample.distance_km,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to decode CSC measurement: {}", e),
        }
        out
    }

    fn sample_due(&self, now: Instant) -> bool {
        match (self.min_interval, self.last_sample) {
            (Some(interval), Some(last)) => now.duration_since(last) >= interval,
            _ => true,
        }
    }
}
