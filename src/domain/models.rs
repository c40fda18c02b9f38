use serde::Serialize;

/// A peripheral seen while scanning, keyed by its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Platform identifier: a MAC address on Linux and Windows, a UUID on macOS.
    pub address: String,
    pub name: Option<String>,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Bare address with no advertised name, used when a device id was never seen in a scan.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self::new(address, None)
    }

    /// Name shown to the parent process.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Decoded output of one CSC notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub cadence_rpm: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub distance_km: f64,
}

impl TelemetrySample {
    /// True when neither a speed nor a cadence rate was produced.
    pub fn is_empty(&self) -> bool {
        self.cadence_rpm.is_none() && self.speed_kmh.is_none()
    }
}

/// Lifecycle phase of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Scanning,
    Resolving,
    Connecting,
    DiscoveringService,
    Subscribed,
    Disconnecting,
    Failed,
}

impl ConnectionPhase {
    /// Phases that belong to an in-flight connect attempt.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Resolving | Self::Connecting | Self::DiscoveringService
        )
    }

    /// Whether moving from `self` to `next` is a legal step of the lifecycle.
    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        match (self, next) {
            (Idle, Scanning) | (Scanning, Idle) => true,
            (Idle | Scanning, Resolving) => true,
            // a failed attempt goes back to resolving for the next retry
            (Resolving | Connecting | DiscoveringService, Resolving) => true,
            (Resolving, Connecting) => true,
            (Connecting, DiscoveringService) => true,
            (DiscoveringService, Subscribed) => true,
            (Resolving | Connecting | DiscoveringService, Failed) => true,
            (Resolving | Connecting | DiscoveringService | Subscribed, Disconnecting) => true,
            (Disconnecting | Failed, Idle) => true,
            _ => false,
        }
    }
}

/// Events raised by the connection lifecycle towards the telemetry session.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    DeviceFound(DiscoveredDevice),
    Connected,
    Notification(Vec<u8>),
    Disconnected,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_address() {
        let named = DiscoveredDevice::new("AA:BB", Some("deskbike-13851".to_string()));
        let anonymous = DiscoveredDevice::from_address("CC:DD");
        assert_eq!(named.display_name(), "deskbike-13851");
        assert_eq!(anonymous.display_name(), "CC:DD");
    }

    #[test]
    fn test_happy_path_transitions() {
        use ConnectionPhase::*;
        let path = [
            Idle,
            Scanning,
            Resolving,
            Connecting,
            DiscoveringService,
            Subscribed,
            Disconnecting,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejects_skipping_phases() {
        use ConnectionPhase::*;
        assert!(!Idle.can_transition_to(Subscribed));
        assert!(!Scanning.can_transition_to(Connecting));
        assert!(!Subscribed.can_transition_to(Idle));
        assert!(!Failed.can_transition_to(Subscribed));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Idle));
    }

    #[test]
    fn test_empty_sample() {
        let sample = TelemetrySample {
            distance_km: 1.5,
            ..Default::default()
        };
        assert!(sample.is_empty());
        let sample = TelemetrySample {
            cadence_rpm: Some(70.0),
            ..sample
        };
        assert!(!sample.is_empty());
    }
}
