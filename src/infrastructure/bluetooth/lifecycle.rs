//! Connection Lifecycle Manager
//!
//! Sequences scan → resolve → connect → service discovery → subscribe →
//! stream → disconnect against a [`BleAdapter`].
//!
//! Phases are serialized: at most one scan task and one connect task exist at
//! a time, and a connect always waits for the scan task to finish (adapter
//! released) before touching the radio.

use crate::domain::models::{AppEvent, ConnectionPhase, DiscoveredDevice};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::adapter::{
    Advertisement, BleAdapter, BleError, BleLink, DisconnectCallback, GattCharacteristic,
    NotificationStream, ScanFilter,
};
use crate::infrastructure::bluetooth::gate::SessionGate;
use crate::infrastructure::bluetooth::protocol::{self, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID};
use crate::infrastructure::bluetooth::retry::RetryPolicy;
use anyhow::Context;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for lifecycle behavior
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub filter: ScanFilter,
    pub service_uuid: Uuid,
    pub measurement_uuid: Uuid,
    /// Bound on looking up a device that was not seen during a scan
    pub resolve_timeout: Duration,
    /// Pause after the scan is torn down, before the first connect attempt
    pub scan_settle: Duration,
    /// Bound on a single link establishment
    pub connect_timeout: Duration,
    /// Whole attempt: resolve + connect + discovery + subscribe
    pub connect_retry: RetryPolicy,
    /// Service discovery within one established link
    pub discovery_retry: RetryPolicy,
}

impl LifecycleConfig {
    pub fn from_settings(settings: &BleSettings) -> anyhow::Result<Self> {
        let service_uuid = protocol::parse_uuid(&settings.service_uuid)
            .with_context(|| format!("invalid service_uuid {:?}", settings.service_uuid))?;
        let measurement_uuid = protocol::parse_uuid(&settings.measurement_uuid)
            .with_context(|| format!("invalid measurement_uuid {:?}", settings.measurement_uuid))?;

        Ok(Self {
            filter: ScanFilter {
                service_uuid,
                name_prefix: settings.name_prefix.clone(),
            },
            service_uuid,
            measurement_uuid,
            resolve_timeout: Duration::from_millis(settings.resolve_timeout_ms),
            scan_settle: Duration::from_millis(settings.scan_settle_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            connect_retry: settings.connect_retry.into(),
            discovery_retry: settings.discovery_retry.into(),
        })
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let settings = BleSettings::default();
        Self {
            filter: ScanFilter {
                service_uuid: CSC_SERVICE_UUID,
                name_prefix: None,
            },
            service_uuid: CSC_SERVICE_UUID,
            measurement_uuid: CSC_MEASUREMENT_UUID,
            resolve_timeout: Duration::from_millis(settings.resolve_timeout_ms),
            scan_settle: Duration::from_millis(settings.scan_settle_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            connect_retry: settings.connect_retry.into(),
            discovery_retry: settings.discovery_retry.into(),
        }
    }
}

/// Headroom over `resolve_timeout` before an address lookup is abandoned.
const RESOLVE_GRACE: Duration = Duration::from_secs(1);

struct ScanTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ScanTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the scan loop and wait until it has released the adapter.
    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!("Scan task ended abnormally: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log and drop the outcome of a teardown step. The link may already be gone.
fn best_effort(step: &str, result: Result<(), BleError>) {
    if let Err(e) = result {
        debug!("Ignoring {} failure during teardown: {}", step, e);
    }
}

/// Bail out of an attempt once the session has been told to end.
fn ensure_live(gate: &SessionGate) -> Result<(), BleError> {
    if gate.is_fired() {
        Err(BleError::Cancelled)
    } else {
        Ok(())
    }
}

struct Shared<A: BleAdapter> {
    adapter: A,
    config: LifecycleConfig,
    phase: watch::Sender<ConnectionPhase>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    discovered: Mutex<HashMap<String, DiscoveredDevice>>,
    scan_task: Mutex<Option<ScanTask>>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    session_gate: Mutex<Option<Arc<SessionGate>>>,
}

/// Drives one adapter through the connection lifecycle.
pub struct ConnectionManager<A: BleAdapter> {
    shared: Arc<Shared<A>>,
}

impl<A: BleAdapter> Clone for ConnectionManager<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A: BleAdapter> ConnectionManager<A> {
    pub fn new(
        adapter: A,
        config: LifecycleConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Idle);
        Self {
            shared: Arc::new(Shared {
                adapter,
                config,
                phase,
                event_sender,
                discovered: Mutex::new(HashMap::new()),
                scan_task: Mutex::new(None),
                connect_task: Mutex::new(None),
                session_gate: Mutex::new(None),
            }),
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase.subscribe()
    }

    #[cfg(test)]
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        lock(&self.shared.discovered).values().cloned().collect()
    }

    /// Start discovery. No-op while a scan or a connect is in flight.
    pub fn scan(&self) -> bool {
        if self.shared.connect_in_flight() {
            debug!("Scan request ignored: connect in progress");
            return false;
        }

        let mut slot = lock(&self.shared.scan_task);
        if slot.as_ref().map_or(false, ScanTask::is_running) {
            debug!("Scan request ignored: already scanning");
            return false;
        }
        if !self.shared.transition(ConnectionPhase::Scanning) {
            return false;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(self.shared.clone().run_scan(stop_rx));
        *slot = Some(ScanTask {
            stop: stop_tx,
            handle,
        });
        true
    }

    /// Start a connect task for `device_id`. No-op while one is in flight.
    pub fn connect(&self, device_id: &str) -> bool {
        let mut slot = lock(&self.shared.connect_task);
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            debug!("Connect request for {} ignored: connect in progress", device_id);
            return false;
        }

        let gate = Arc::new(SessionGate::new());
        *lock(&self.shared.session_gate) = Some(gate.clone());
        let scan = lock(&self.shared.scan_task).take();

        let shared = self.shared.clone();
        let device_id = device_id.to_string();
        *slot = Some(tokio::spawn(async move {
            shared.run_connect(device_id, gate, scan).await
        }));
        true
    }

    /// Ask the live session (or in-flight connect) to end. Idempotent.
    pub fn disconnect(&self) -> bool {
        let gate = lock(&self.shared.session_gate).clone();
        match gate {
            Some(gate) if gate.fire() => {
                info!("Disconnect requested");
                true
            }
            _ => {
                debug!("Disconnect request ignored: no live session");
                false
            }
        }
    }

    /// End everything and wait up to `grace` for the connect task to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.disconnect();

        let scan = lock(&self.shared.scan_task).take();
        if let Some(scan) = scan {
            scan.stop().await;
        }

        let connect = lock(&self.shared.connect_task).take();
        if let Some(handle) = connect {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Connect task still running after {:?}, abandoning it", grace);
            }
        }
    }
}

impl<A: BleAdapter> Shared<A> {
    fn emit(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn current_phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    fn connect_in_flight(&self) -> bool {
        lock(&self.connect_task)
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Move to `next` if the lifecycle allows it.
    fn transition(&self, next: ConnectionPhase) -> bool {
        let mut moved = false;
        self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            if !phase.can_transition_to(next) {
                warn!("Ignoring phase change {:?} -> {:?}", phase, next);
                return false;
            }
            info!("Phase {:?} -> {:?}", phase, next);
            *phase = next;
            moved = true;
            true
        });
        moved
    }

    fn transition_from(&self, from: ConnectionPhase, next: ConnectionPhase) -> bool {
        self.current_phase() == from && self.transition(next)
    }

    fn clear_gate(&self, gate: &Arc<SessionGate>) {
        let mut slot = lock(&self.session_gate);
        if slot.as_ref().map_or(false, |g| Arc::ptr_eq(g, gate)) {
            *slot = None;
        }
    }

    async fn run_scan(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        info!(
            "Starting BLE scan for service {}",
            self.config.filter.service_uuid
        );

        let mut stream = match self.adapter.scan(&self.config.filter).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.emit(AppEvent::Error(format!("Scan failed: {}", e)));
                self.transition_from(ConnectionPhase::Scanning, ConnectionPhase::Idle);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut stop => break,
                next = stream.next() => match next {
                    Some((device, advertisement)) => {
                        if self.config.filter.matches(&advertisement) {
                            self.record_device(device, &advertisement);
                        }
                    }
                    None => {
                        warn!("Scan stream ended");
                        break;
                    }
                },
            }
        }

        drop(stream);
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        info!("Scan stopped");
        self.transition_from(ConnectionPhase::Scanning, ConnectionPhase::Idle);
    }

    /// Remember a sighting and announce it when it is new or renamed.
    fn record_device(&self, mut device: DiscoveredDevice, advertisement: &Advertisement) {
        if device.name.is_none() {
            device.name = advertisement.local_name.clone();
        }

        let announce = {
            let mut known = lock(&self.discovered);
            match known.get_mut(&device.address) {
                None => {
                    known.insert(device.address.clone(), device.clone());
                    Some(device)
                }
                Some(existing) => match device.name {
                    Some(name) if existing.name.as_ref() != Some(&name) => {
                        existing.name = Some(name);
                        Some(existing.clone())
                    }
                    _ => None,
                },
            }
        };

        if let Some(device) = announce {
            info!("Found device {} ({})", device.address, device.display_name());
            self.emit(AppEvent::DeviceFound(device));
        }
    }

    async fn run_connect(
        self: Arc<Self>,
        device_id: String,
        gate: Arc<SessionGate>,
        scan: Option<ScanTask>,
    ) {
        if let Some(scan) = scan {
            info!("Stopping scan before connecting");
            scan.stop().await;
        }
        // let the adapter driver drop its discovery state
        tokio::time::sleep(self.config.scan_settle).await;

        let result = self
            .config
            .connect_retry
            .run(
                "connect",
                |attempt| {
                    let this = self.clone();
                    let gate = gate.clone();
                    let device_id = device_id.clone();
                    async move { this.attempt(&device_id, &gate, attempt).await }
                },
                |e| !matches!(e, BleError::Cancelled),
            )
            .await;

        match result {
            Ok(()) => {}
            Err(BleError::Cancelled) => {
                info!("Connect to {} cancelled", device_id);
                if self.current_phase().is_connecting() {
                    self.transition(ConnectionPhase::Disconnecting);
                }
                self.emit(AppEvent::Disconnected);
                self.transition(ConnectionPhase::Idle);
            }
            Err(e) => {
                error!("Connection to {} failed: {}", device_id, e);
                self.transition(ConnectionPhase::Failed);
                self.emit(AppEvent::Error(e.to_string()));
                self.transition(ConnectionPhase::Idle);
            }
        }

        self.clear_gate(&gate);
    }

    /// One full attempt. Returns `Ok` once a subscribed session has ended.
    async fn attempt(
        &self,
        device_id: &str,
        gate: &Arc<SessionGate>,
        attempt: u32,
    ) -> Result<(), BleError> {
        ensure_live(gate)?;
        self.transition(ConnectionPhase::Resolving);
        let device = self.resolve(device_id).await?;

        ensure_live(gate)?;
        self.transition(ConnectionPhase::Connecting);
        info!("Connecting to {} (attempt {})", device.address, attempt);

        // link loss only ends the session once it is subscribed; before that
        // it shows up as a failed step and the attempt is retried
        let armed = Arc::new(AtomicBool::new(false));
        let on_disconnect: DisconnectCallback = {
            let armed = armed.clone();
            let gate = gate.clone();
            Arc::new(move || {
                if armed.load(Ordering::SeqCst) && gate.fire() {
                    info!("Adapter reported link loss");
                }
            })
        };

        let timeout = self.config.connect_timeout;
        let link = match tokio::time::timeout(timeout, self.adapter.connect(&device, on_disconnect))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(BleError::Timeout(timeout, "connecting")),
        };

        let (characteristic, notifications) = match self.subscribe_measurement(&link, gate).await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                best_effort("disconnect", link.disconnect().await);
                return Err(e);
            }
        };

        armed.store(true, Ordering::SeqCst);
        self.transition(ConnectionPhase::Subscribed);
        info!("Subscribed to CSC measurements from {}", device.address);
        self.emit(AppEvent::Connected);

        self.stream_notifications(notifications, gate).await;

        self.transition(ConnectionPhase::Disconnecting);
        best_effort("unsubscribe", link.unsubscribe(&characteristic).await);
        best_effort("disconnect", link.disconnect().await);
        info!("Disconnected from {}", device.address);
        self.emit(AppEvent::Disconnected);
        self.transition(ConnectionPhase::Idle);
        Ok(())
    }

    /// Reuse a scanned device, otherwise do a bounded address lookup.
    async fn resolve(&self, device_id: &str) -> Result<DiscoveredDevice, BleError> {
        let known = lock(&self.discovered).get(device_id).cloned();
        if let Some(device) = known {
            debug!("Using scanned device {}", device_id);
            return Ok(device);
        }

        info!("Device {} not seen in scan, resolving address", device_id);
        let timeout = self.config.resolve_timeout;
        // the adapter bounds its own lookup; this only catches one that hangs
        let resolved = match tokio::time::timeout(
            timeout + RESOLVE_GRACE,
            self.adapter.resolve_address(device_id, timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!("Address lookup for {} overran {:?}", device_id, timeout);
                // the abandoned lookup may have left discovery running
                best_effort("stop_scan", self.adapter.stop_scan().await);
                None
            }
        };

        match resolved {
            Some(device) => {
                lock(&self.discovered).insert(device_id.to_string(), device.clone());
                Ok(device)
            }
            None => {
                // only real lookups are cached so a retry resolves again
                warn!("Could not resolve {}, connecting by address", device_id);
                Ok(DiscoveredDevice::from_address(device_id))
            }
        }
    }

    async fn subscribe_measurement(
        &self,
        link: &A::Link,
        gate: &SessionGate,
    ) -> Result<(GattCharacteristic, NotificationStream), BleError> {
        ensure_live(gate)?;
        self.transition(ConnectionPhase::DiscoveringService);

        let characteristic = self
            .config
            .discovery_retry
            .run(
                "service discovery",
                |_| self.find_measurement(link),
                |e| !matches!(e, BleError::Cancelled),
            )
            .await
            .map_err(|e| match e {
                BleError::EmptyServiceTable => BleError::CharacteristicNotFound {
                    uuid: self.config.measurement_uuid,
                    discovered: Vec::new(),
                },
                other => other,
            })?;

        ensure_live(gate)?;
        let notifications = link.subscribe(&characteristic).await?;
        Ok((characteristic, notifications))
    }

    async fn find_measurement(&self, link: &A::Link) -> Result<GattCharacteristic, BleError> {
        let table = link.discover_services().await?;
        if table.is_empty() {
            return Err(BleError::EmptyServiceTable);
        }

        let uuid = self.config.measurement_uuid;
        if let Some(characteristic) = table.get_characteristic(&self.config.service_uuid, &uuid) {
            return Ok(characteristic.clone());
        }

        debug!(
            "Characteristic {} not under service {}, enumerating all services",
            uuid, self.config.service_uuid
        );
        table
            .find_characteristic(&uuid)
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound {
                uuid,
                discovered: table.describe(),
            })
    }

    /// Forward notifications until the session gate fires or the stream ends.
    async fn stream_notifications(&self, mut notifications: NotificationStream, gate: &SessionGate) {
        let mut count: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = gate.wait() => break,
                next = notifications.next() => match next {
                    Some(payload) => {
                        count += 1;
                        trace!("Notification #{}: {:02X?}", count, payload);
                        self.emit(AppEvent::Notification(payload));
                    }
                    None => {
                        if gate.fire() {
                            info!("Notification stream closed, treating as link loss");
                        }
                        break;
                    }
                },
            }
        }
        info!("Session ended after {} notifications", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::adapter::{GattService, ScanStream, ServiceTable};
    use crate::infrastructure::bluetooth::protocol::uuid_from_u16;
    use async_trait::async_trait;
    use futures::channel::mpsc as notify_channel;
    use std::sync::atomic::{AtomicU32, AtomicU64};

    /// How an address lookup behaves.
    #[derive(Debug, Clone, Copy, Default)]
    enum Lookup {
        #[default]
        Found,
        Missing,
        /// Scans for the whole lookup window, then gives up
        Slow,
        /// Starts scanning and never returns
        Hang,
        Fail,
    }

    #[derive(Default)]
    struct Script {
        // behaviour
        lookup: Mutex<Lookup>,
        connect_failures: AtomicU32,
        connect_delay_ms: AtomicU64,
        empty_discoveries: AtomicU32,
        missing_characteristic: AtomicBool,
        fail_unsubscribe: AtomicBool,
        advertised: Mutex<Vec<(DiscoveredDevice, Advertisement)>>,
        // observations
        resolve_calls: AtomicU32,
        last_connected: Mutex<Option<DiscoveredDevice>>,
        connect_calls: AtomicU32,
        discovery_calls: AtomicU32,
        unsubscribe_calls: AtomicU32,
        disconnect_calls: AtomicU32,
        scan_active: AtomicBool,
        connected_while_scanning: AtomicBool,
        notifier: Mutex<Option<notify_channel::UnboundedSender<Vec<u8>>>>,
        on_disconnect: Mutex<Option<DisconnectCallback>>,
    }

    impl Script {
        fn push(&self, payload: &[u8]) {
            self.notifier
                .lock()
                .unwrap()
                .as_ref()
                .expect("not subscribed")
                .unbounded_send(payload.to_vec())
                .unwrap();
        }

        fn lose_link(&self) {
            let callback = self.on_disconnect.lock().unwrap().clone();
            (callback.expect("never connected"))();
        }
    }

    struct FakeAdapter {
        script: Arc<Script>,
    }

    struct FakeLink {
        script: Arc<Script>,
    }

    #[async_trait]
    impl BleAdapter for FakeAdapter {
        type Link = FakeLink;

        async fn scan(&self, _filter: &ScanFilter) -> Result<ScanStream, BleError> {
            self.script.scan_active.store(true, Ordering::SeqCst);
            let advertised = self.script.advertised.lock().unwrap().clone();
            Ok(Box::pin(
                futures::stream::iter(advertised).chain(futures::stream::pending()),
            ))
        }

        async fn stop_scan(&self) -> Result<(), BleError> {
            self.script.scan_active.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn resolve_address(
            &self,
            address: &str,
            timeout: Duration,
        ) -> Result<Option<DiscoveredDevice>, BleError> {
            let script = &self.script;
            script.resolve_calls.fetch_add(1, Ordering::SeqCst);
            let lookup = *script.lookup.lock().unwrap();
            match lookup {
                Lookup::Found => Ok(Some(DiscoveredDevice::new(
                    address,
                    Some("resolved".to_string()),
                ))),
                Lookup::Missing => Ok(None),
                Lookup::Fail => Err(BleError::Adapter("org.bluez.Error.NotReady".to_string())),
                Lookup::Slow => {
                    // start_scan takes a while before the lookup window opens
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    script.scan_active.store(true, Ordering::SeqCst);
                    let _ = tokio::time::timeout(timeout, futures::future::pending::<()>()).await;
                    script.scan_active.store(false, Ordering::SeqCst);
                    Ok(None)
                }
                Lookup::Hang => {
                    script.scan_active.store(true, Ordering::SeqCst);
                    futures::future::pending().await
                }
            }
        }

        async fn connect(
            &self,
            device: &DiscoveredDevice,
            on_disconnect: DisconnectCallback,
        ) -> Result<FakeLink, BleError> {
            let script = &self.script;
            script.connect_calls.fetch_add(1, Ordering::SeqCst);
            *script.last_connected.lock().unwrap() = Some(device.clone());
            if script.scan_active.load(Ordering::SeqCst) {
                script.connected_while_scanning.store(true, Ordering::SeqCst);
            }
            let delay = script.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if script.connect_failures.load(Ordering::SeqCst) > 0 {
                script.connect_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BleError::Connect("le-connection-abort-by-local".to_string()));
            }
            *script.on_disconnect.lock().unwrap() = Some(on_disconnect);
            Ok(FakeLink {
                script: script.clone(),
            })
        }
    }

    #[async_trait]
    impl BleLink for FakeLink {
        async fn discover_services(&self) -> Result<ServiceTable, BleError> {
            let script = &self.script;
            script.discovery_calls.fetch_add(1, Ordering::SeqCst);
            if script.empty_discoveries.load(Ordering::SeqCst) > 0 {
                script.empty_discoveries.fetch_sub(1, Ordering::SeqCst);
                return Ok(ServiceTable::default());
            }

            let battery = uuid_from_u16(0x180f);
            let mut services = vec![GattService {
                uuid: battery,
                characteristics: vec![GattCharacteristic {
                    service_uuid: battery,
                    uuid: uuid_from_u16(0x2a19),
                }],
            }];
            if !script.missing_characteristic.load(Ordering::SeqCst) {
                services.push(GattService {
                    uuid: CSC_SERVICE_UUID,
                    characteristics: vec![GattCharacteristic {
                        service_uuid: CSC_SERVICE_UUID,
                        uuid: CSC_MEASUREMENT_UUID,
                    }],
                });
            }
            Ok(ServiceTable { services })
        }

        async fn subscribe(
            &self,
            _characteristic: &GattCharacteristic,
        ) -> Result<NotificationStream, BleError> {
            let (tx, rx) = notify_channel::unbounded();
            *self.script.notifier.lock().unwrap() = Some(tx);
            Ok(Box::pin(rx))
        }

        async fn unsubscribe(&self, _characteristic: &GattCharacteristic) -> Result<(), BleError> {
            self.script.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            if self.script.fail_unsubscribe.load(Ordering::SeqCst) {
                return Err(BleError::Adapter("Not connected".to_string()));
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BleError> {
            self.script.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn csc_advertisement() -> Advertisement {
        Advertisement {
            local_name: None,
            service_uuids: vec![CSC_SERVICE_UUID],
        }
    }

    fn harness(
        script: Script,
    ) -> (
        ConnectionManager<FakeAdapter>,
        Arc<Script>,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let script = Arc::new(script);
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = FakeAdapter {
            script: script.clone(),
        };
        (
            ConnectionManager::new(adapter, LifecycleConfig::default(), tx),
            script,
            rx,
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<AppEvent>) {
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "unexpected extra event");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_matching_devices() {
        let script = Script::default();
        *script.advertised.lock().unwrap() = vec![
            (
                DiscoveredDevice::new("AA", Some("deskbike-13851".to_string())),
                csc_advertisement(),
            ),
            (
                DiscoveredDevice::new("BB", Some("Phone".to_string())),
                Advertisement::default(),
            ),
            (
                DiscoveredDevice::new("AA", Some("deskbike-13851".to_string())),
                csc_advertisement(),
            ),
            (DiscoveredDevice::from_address("AA"), csc_advertisement()),
            (
                DiscoveredDevice::new("AA", Some("deskbike-renamed".to_string())),
                csc_advertisement(),
            ),
        ];
        let (manager, _script, mut rx) = harness(script);

        assert!(manager.scan());
        assert!(!manager.scan());
        assert_eq!(manager.phase(), ConnectionPhase::Scanning);

        assert_eq!(
            next_event(&mut rx).await,
            AppEvent::DeviceFound(DiscoveredDevice::new(
                "AA",
                Some("deskbike-13851".to_string())
            ))
        );
        assert_eq!(
            next_event(&mut rx).await,
            AppEvent::DeviceFound(DiscoveredDevice::new(
                "AA",
                Some("deskbike-renamed".to_string())
            ))
        );
        assert_quiet(&mut rx).await;
        assert_eq!(manager.discovered_devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_scan_release() {
        let script = Script::default();
        *script.advertised.lock().unwrap() = vec![(
            DiscoveredDevice::new("AA", Some("deskbike".to_string())),
            csc_advertisement(),
        )];
        let (manager, script, mut rx) = harness(script);

        assert!(manager.scan());
        assert!(matches!(next_event(&mut rx).await, AppEvent::DeviceFound(_)));

        let start = tokio::time::Instant::now();
        assert!(manager.connect("AA"));
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert!(start.elapsed() >= Duration::from_millis(200));

        assert!(!script.connected_while_scanning.load(Ordering::SeqCst));
        assert!(!script.scan_active.load(Ordering::SeqCst));
        assert_eq!(manager.phase(), ConnectionPhase::Subscribed);
        // scanning is refused while a session is live
        assert!(!manager.scan());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_is_ignored() {
        let script = Script::default();
        script.connect_delay_ms.store(100, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        assert!(manager.connect("AA"));
        assert!(!manager.connect("AA"));
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert!(!manager.connect("AA"));
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_connect_failures_are_retried() {
        let script = Script::default();
        script.connect_failures.store(2, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_one_error() {
        let script = Script::default();
        script.connect_failures.store(10, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        match next_event(&mut rx).await {
            AppEvent::Error(message) => assert!(message.contains("le-connection-abort-by-local")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_quiet(&mut rx).await;
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);

        // manager accepts new commands afterwards
        script.connect_failures.store(0, Ordering::SeqCst);
        assert!(manager.connect("AA"));
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_service_tables_are_retried() {
        let script = Script::default();
        script.empty_discoveries.store(2, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert_eq!(script.discovery_calls.load(Ordering::SeqCst), 3);
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_carries_diagnostics() {
        let script = Script::default();
        script.missing_characteristic.store(true, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        match next_event(&mut rx).await {
            AppEvent::Error(message) => {
                assert!(message.contains("00002a5b-0000-1000-8000-00805f9b34fb"));
                assert!(message.contains("180f/2a19"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_quiet(&mut rx).await;
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(script.discovery_calls.load(Ordering::SeqCst), 9);
        // every failed link is released
        assert_eq!(script.disconnect_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_until_disconnect_request() {
        let (manager, script, mut rx) = harness(Script::default());

        manager.connect("AA");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);

        script.push(&[0x02, 0x0a, 0x00, 0x00, 0x02]);
        assert_eq!(
            next_event(&mut rx).await,
            AppEvent::Notification(vec![0x02, 0x0a, 0x00, 0x00, 0x02])
        );

        assert!(manager.disconnect());
        assert!(!manager.disconnect());
        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);

        // a late link-loss callback from the same link changes nothing
        script.lose_link();
        assert_quiet(&mut rx).await;
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
        assert_eq!(script.unsubscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(script.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_ends_session_once() {
        let (manager, script, mut rx) = harness(Script::default());

        manager.connect("AA");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);

        script.lose_link();
        script.lose_link();
        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);
        assert!(!manager.disconnect());
        assert_quiet(&mut rx).await;
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_retry_loop() {
        let script = Script::default();
        script.connect_failures.store(1, Ordering::SeqCst);
        script.connect_delay_ms.store(100, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        // settle delay is 200 ms, first attempt is then mid-connect
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(manager.disconnect());

        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);
        assert_quiet(&mut rx).await;
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_link_is_coming_up() {
        let script = Script::default();
        script.connect_delay_ms.store(100, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(manager.disconnect());

        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);
        assert_quiet(&mut rx).await;
        assert_eq!(script.discovery_calls.load(Ordering::SeqCst), 0);
        assert_eq!(script.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_failure_is_swallowed() {
        let script = Script::default();
        script.fail_unsubscribe.store(true, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("AA");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        manager.disconnect();
        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);
        assert_quiet(&mut rx).await;
        assert_eq!(script.unsubscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(script.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_session_end() {
        let (manager, script, mut rx) = harness(Script::default());

        manager.connect("CC:DD");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        let resolved = manager.discovered_devices();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name.as_deref(), Some("resolved"));

        manager.disconnect();
        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);

        assert!(manager.connect("CC:DD"));
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookup_ends_its_scan_before_connect() {
        let script = Script::default();
        *script.lookup.lock().unwrap() = Lookup::Slow;
        let (manager, script, mut rx) = harness(script);

        manager.connect("CC:DD");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert!(!script.connected_while_scanning.load(Ordering::SeqCst));
        assert!(!script.scan_active.load(Ordering::SeqCst));
        assert_eq!(script.resolve_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *script.last_connected.lock().unwrap(),
            Some(DiscoveredDevice::from_address("CC:DD"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_lookup_is_abandoned_and_its_scan_stopped() {
        let script = Script::default();
        *script.lookup.lock().unwrap() = Lookup::Hang;
        let (manager, script, mut rx) = harness(script);

        let start = tokio::time::Instant::now();
        manager.connect("CC:DD");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        let bound = LifecycleConfig::default().resolve_timeout + RESOLVE_GRACE;
        assert!(start.elapsed() >= bound);
        assert!(!script.connected_while_scanning.load(Ordering::SeqCst));
        assert_eq!(
            *script.last_connected.lock().unwrap(),
            Some(DiscoveredDevice::from_address("CC:DD"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_device_is_looked_up_again_on_retry() {
        let script = Script::default();
        *script.lookup.lock().unwrap() = Lookup::Missing;
        script.connect_failures.store(1, Ordering::SeqCst);
        let (manager, script, mut rx) = harness(script);

        manager.connect("CC:DD");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(script.resolve_calls.load(Ordering::SeqCst), 2);
        assert!(manager.discovered_devices().is_empty());
        let device = script.last_connected.lock().unwrap().clone().unwrap();
        assert_eq!(device.address, "CC:DD");
        assert_eq!(device.name, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_lookup_reports_one_error() {
        let script = Script::default();
        *script.lookup.lock().unwrap() = Lookup::Fail;
        let (manager, script, mut rx) = harness(script);

        manager.connect("CC:DD");
        match next_event(&mut rx).await {
            AppEvent::Error(message) => assert!(message.contains("NotReady")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_quiet(&mut rx).await;
        assert_eq!(script.resolve_calls.load(Ordering::SeqCst), 3);
        assert_eq!(script.connect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_live_session() {
        let (manager, _script, mut rx) = harness(Script::default());

        manager.connect("AA");
        assert_eq!(next_event(&mut rx).await, AppEvent::Connected);
        manager.shutdown(Duration::from_secs(2)).await;
        assert_eq!(next_event(&mut rx).await, AppEvent::Disconnected);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
    }

    #[test]
    fn test_config_from_settings_accepts_short_uuid() {
        let settings = BleSettings {
            measurement_uuid: "2a5b".to_string(),
            name_prefix: Some("deskbike".to_string()),
            ..BleSettings::default()
        };
        let config = LifecycleConfig::from_settings(&settings).unwrap();
        assert_eq!(config.measurement_uuid, CSC_MEASUREMENT_UUID);
        assert_eq!(config.filter.name_prefix.as_deref(), Some("deskbike"));
        assert_eq!(config.connect_retry.max_attempts, 3);

        let invalid = BleSettings {
            service_uuid: "nope".to_string(),
            ..BleSettings::default()
        };
        assert!(LifecycleConfig::from_settings(&invalid).is_err());
    }
}
