//! Cycling Speed and Cadence measurement decoding
//!
//! Turns raw CSC Measurement notifications into speed, cadence and cumulative
//! distance. Rates are derived from the difference between two consecutive
//! notifications, so the decoder carries the previous reading per channel.

use crate::domain::models::TelemetrySample;
use crate::domain::wrap::{delta16, delta32};
use thiserror::Error;
use tracing::trace;

/// CSC event timers tick at 1/1024 second.
pub const TICKS_PER_SECOND: f64 = 1024.0;

/// Default wheel circumference in metres.
pub const DEFAULT_WHEEL_CIRCUMFERENCE_M: f64 = 2.10;

const FLAG_WHEEL_PRESENT: u8 = 0x01;
const FLAG_CRANK_PRESENT: u8 = 0x02;

const WHEEL_FIELDS_LEN: usize = 6;
const CRANK_FIELDS_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed CSC packet: flags require {needed} bytes, got {actual}")]
    MalformedPacket { needed: usize, actual: usize },
}

/// Cumulative revolutions paired with the event timer of the last revolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevolutionSample<R> {
    pub revolutions: R,
    pub timer_ticks: u16,
}

/// One parsed notification. A channel is `None` when its flag bit is clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CscMeasurement {
    pub wheel: Option<RevolutionSample<u32>>,
    pub crank: Option<RevolutionSample<u16>>,
}

impl CscMeasurement {
    /// Parse a CSC Measurement payload
    ///
    /// # Layout
    ///
    /// ```text
    /// [0]     : Flags
    ///           bit 0: wheel revolution data present
    ///           bit 1: crank revolution data present
    ///
    /// If wheel data present:
    /// [+0..4] : Cumulative wheel revolutions (u32 little-endian)
    /// [+4..6] : Last wheel event time (u16 little-endian, 1/1024 s)
    ///
    /// If crank data present (always after the wheel fields):
    /// [+0..2] : Cumulative crank revolutions (u16 little-endian)
    /// [+2..4] : Last crank event time (u16 little-endian, 1/1024 s)
    /// ```
    ///
    /// Trailing bytes beyond what the flags declare are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let Some(&flags) = payload.first() else {
            return Err(DecodeError::MalformedPacket {
                needed: 1,
                actual: 0,
            });
        };

        let has_wheel = flags & FLAG_WHEEL_PRESENT != 0;
        let has_crank = flags & FLAG_CRANK_PRESENT != 0;

        let needed = 1
            + if has_wheel { WHEEL_FIELDS_LEN } else { 0 }
            + if has_crank { CRANK_FIELDS_LEN } else { 0 };
        if payload.len() < needed {
            return Err(DecodeError::MalformedPacket {
                needed,
                actual: payload.len(),
            });
        }

        let mut idx = 1;
        let wheel = if has_wheel {
            let revolutions = u32::from_le_bytes([
                payload[idx],
                payload[idx + 1],
                payload[idx + 2],
                payload[idx + 3],
            ]);
            let timer_ticks = u16::from_le_bytes([payload[idx + 4], payload[idx + 5]]);
            idx += WHEEL_FIELDS_LEN;
            Some(RevolutionSample {
                revolutions,
                timer_ticks,
            })
        } else {
            None
        };

        let crank = if has_crank {
            let revolutions = u16::from_le_bytes([payload[idx], payload[idx + 1]]);
            let timer_ticks = u16::from_le_bytes([payload[idx + 2], payload[idx + 3]]);
            Some(RevolutionSample {
                revolutions,
                timer_ticks,
            })
        } else {
            None
        };

        Ok(Self { wheel, crank })
    }
}

/// State carried between notifications of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderState {
    pub last_wheel: Option<RevolutionSample<u32>>,
    pub last_crank: Option<RevolutionSample<u16>>,
    pub cumulative_distance_m: f64,
}

/// Stateful CSC decoder. One instance per telemetry session.
#[derive(Debug, Clone)]
pub struct CscDecoder {
    wheel_circumference_m: f64,
    reset_distance: bool,
    state: DecoderState,
}

impl CscDecoder {
    pub fn new(wheel_circumference_m: f64, reset_distance: bool) -> Self {
        Self {
            wheel_circumference_m,
            reset_distance,
            state: DecoderState::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Forget both baselines so no delta spans a reconnect.
    pub fn reset(&mut self) {
        self.state.last_wheel = None;
        self.state.last_crank = None;
        if self.reset_distance {
            self.state.cumulative_distance_m = 0.0;
        }
    }

    /// Decode one notification and advance the baselines.
    ///
    /// A malformed payload leaves the state untouched.
    pub fn decode(&mut self, payload: &[u8]) -> Result<TelemetrySample, DecodeError> {
        let measurement = CscMeasurement::parse(payload)?;
        Ok(self.apply(measurement))
    }

    /// Fold an already parsed measurement into the decoder state.
    pub fn apply(&mut self, measurement: CscMeasurement) -> TelemetrySample {
        let mut speed_kmh = None;
        let mut cadence_rpm = None;

        if let (Some(wheel), Some(prev)) = (measurement.wheel, self.state.last_wheel) {
            let d_revs = delta32(wheel.revolutions, prev.revolutions);
            let d_ticks = delta16(wheel.timer_ticks, prev.timer_ticks);
            if d_ticks > 0 {
                let dt = f64::from(d_ticks) / TICKS_PER_SECOND;
                let distance_delta_m = f64::from(d_revs) * self.wheel_circumference_m;
                self.state.cumulative_distance_m += distance_delta_m;
                speed_kmh = Some((distance_delta_m / dt) * 3.6);
            } else {
                trace!("wheel timer unchanged, skipping speed");
            }
        }

        if let (Some(crank), Some(prev)) = (measurement.crank, self.state.last_crank) {
            let d_revs = delta16(crank.revolutions, prev.revolutions);
            let d_ticks = delta16(crank.timer_ticks, prev.timer_ticks);
            if d_ticks > 0 {
                let dt = f64::from(d_ticks) / TICKS_PER_SECOND;
                cadence_rpm = Some((f64::from(d_revs) / dt) * 60.0);
            } else {
                trace!("crank timer unchanged, skipping cadence");
            }
        }

        if measurement.wheel.is_some() {
            self.state.last_wheel = measurement.wheel;
        }
        if measurement.crank.is_some() {
            self.state.last_crank = measurement.crank;
        }

        TelemetrySample {
            cadence_rpm,
            speed_kmh,
            distance_km: self.state.cumulative_distance_m / 1000.0,
        }
    }
}

impl Default for CscDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_WHEEL_CIRCUMFERENCE_M, false)
    }
}
