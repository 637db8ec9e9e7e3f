//! Connection lifecycle state machine.
//!
//! Owns the single "active target": which device, if any, the bridge is
//! currently scanning for or connected to. Reacts to presence and
//! connection-outcome events from the mux collaborator and decides when to
//! (re)start a scan, when a connection becomes authoritative for outbound
//! traffic, and when to fall back to another attached device.
//!
//! One mutex guards the registry/target pair, so concurrent event delivery is
//! applied atomically and in arrival order. Collaborator calls (starting and
//! stopping scans, probe sends) are issued only after the lock is released;
//! nothing inside the machine blocks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::models::{Device, DeviceId};
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::mux::{
    DeviceMux, MuxError, OutcomeSink, PresenceSink, ScanHandle,
};

/// Payload emitted on the probe channel when a device attaches while a
/// connection is established.
const LIVENESS_PROBE: &[u8] = b"ping";

/// The single device/port (or none) the machine currently considers
/// authoritative for outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTarget {
    /// No device targeted.
    Idle,
    /// A scan is outstanding: advertising for `device` and attempting `port`.
    Scanning { device: DeviceId, port: u16 },
    /// An established connection exists.
    Connected { device: DeviceId, port: u16 },
}

impl Default for ActiveTarget {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Port every connection attempt targets.
    pub device_port: u16,
    /// Channel tag for liveness probes.
    pub probe_channel: u32,
    /// Delay before the fallback scan after a failed or lost connection.
    /// Zero rescans immediately; the fallback may then retarget the device
    /// that just failed if it is still attached.
    pub rescan_backoff: Duration,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    /// No connection is currently established; the payload was dropped.
    #[error("no active target")]
    NoActiveTarget,

    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// The state machine. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    shared: Arc<Shared>,
}

struct Shared {
    mux: Arc<dyn DeviceMux>,
    config: LifecycleConfig,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    registry: DeviceRegistry,
    target: ActiveTarget,
    scan: Option<Box<dyn ScanHandle>>,
}

impl ConnectionLifecycle {
    pub fn new(mux: Arc<dyn DeviceMux>, config: LifecycleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                mux,
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Current target.
    pub fn target(&self) -> ActiveTarget {
        self.lock().target
    }

    /// Forward a relay payload into the established connection.
    pub fn forward(&self, payload: &[u8], channel: u32) -> Result<(), ForwardError> {
        // The lock is held only long enough to read the target.
        let connected = matches!(self.lock().target, ActiveTarget::Connected { .. });
        if !connected {
            return Err(ForwardError::NoActiveTarget);
        }
        self.shared.mux.send(payload, channel)?;
        Ok(())
    }

    /// Stop any outstanding scan. Safe to call multiple times; used during
    /// shutdown.
    pub fn stop_scan(&self) {
        let scan = self.lock().scan.take();
        if let Some(scan) = scan {
            scan.stop();
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Handlers never panic while holding the lock; recover the guard if
        // a test double ever poisons it.
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Issue a scan for `device` through the collaborator and, if the machine
    /// still targets it, retain the handle.
    fn begin_scan(&self, device: DeviceId) {
        let port = self.shared.config.device_port;
        let sink: Arc<dyn OutcomeSink> = Arc::new(self.clone());
        match self.shared.mux.start_scan(sink, device, port) {
            Ok(handle) => {
                let mut state = self.lock();
                // A detach or discovery fault may have retargeted the machine
                // while the scan was being issued.
                if state.target == (ActiveTarget::Scanning { device, port }) {
                    state.scan = Some(handle);
                } else {
                    drop(state);
                    handle.stop();
                }
            }
            Err(e) => {
                error!("Failed to start scan for device {}: {}", device, e);
                let mut state = self.lock();
                if state.target == (ActiveTarget::Scanning { device, port }) {
                    state.target = ActiveTarget::Idle;
                }
            }
        }
    }

    /// Arrange the fallback scan after the target was cleared.
    fn schedule_fallback(&self) {
        let backoff = self.shared.config.rescan_backoff;
        if backoff.is_zero() {
            self.rescan_fallback();
        } else {
            debug!("Waiting {:?} before rescanning", backoff);
            let lifecycle = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                lifecycle.rescan_fallback();
            });
        }
    }

    /// Pick any present device and begin scanning for it, provided the
    /// machine is still idle.
    fn rescan_fallback(&self) {
        let fallback = {
            let mut state = self.lock();
            if state.target != ActiveTarget::Idle {
                return;
            }
            match state.registry.first_present() {
                Some(id) => {
                    state.target = ActiveTarget::Scanning {
                        device: id,
                        port: self.shared.config.device_port,
                    };
                    Some(id)
                }
                None => None,
            }
        };
        match fallback {
            Some(id) => {
                info!("Falling back to device {}", id);
                self.begin_scan(id);
            }
            None => info!("No devices present, staying idle"),
        }
    }
}

impl PresenceSink for ConnectionLifecycle {
    fn device_attached(&self, device: Device) {
        let id = device.id;
        let serial = device.serial.clone();
        let port = self.shared.config.device_port;
        let (old_scan, probe, present) = {
            let mut state = self.lock();
            state.registry.record(device);
            let probe = matches!(state.target, ActiveTarget::Connected { .. });
            let old_scan = state.scan.take();
            state.target = ActiveTarget::Scanning { device: id, port };
            (old_scan, probe, state.registry.len())
        };
        info!(
            "Device attached: {} (id {}), {} present",
            serial, id, present
        );

        if let Some(scan) = old_scan {
            scan.stop();
        }
        self.begin_scan(id);

        if probe {
            // The established connection stays open while the scan retargets;
            // nudge it so a dead peer surfaces as a lost connection.
            if let Err(e) = self
                .shared
                .mux
                .send(LIVENESS_PROBE, self.shared.config.probe_channel)
            {
                warn!("Liveness probe failed: {}", e);
            }
        }
    }

    fn device_detached(&self, id: DeviceId) {
        let (old_scan, was_target, present) = {
            let mut state = self.lock();
            state.registry.remove(id);
            let was_target = match state.target {
                ActiveTarget::Scanning { device, .. } | ActiveTarget::Connected { device, .. } => {
                    device == id
                }
                ActiveTarget::Idle => false,
            };
            let old_scan = if was_target {
                state.target = ActiveTarget::Idle;
                state.scan.take()
            } else {
                None
            };
            (old_scan, was_target, state.registry.len())
        };
        info!("Device detached: id {}, {} present", id, present);

        if let Some(scan) = old_scan {
            scan.stop();
        }
        if !was_target {
            debug!("Detached device {} was not the current target", id);
        }
    }

    fn discovery_error(&self, cause: MuxError) {
        let old_scan = {
            let mut state = self.lock();
            state.target = ActiveTarget::Idle;
            state.scan.take()
        };
        if let Some(scan) = old_scan {
            scan.stop();
        }
        // Terminal for this cycle: repeated discovery faults usually mean a
        // transport-level problem, so no automatic retry.
        error!("Discovery error, scan cycle abandoned: {}", cause);
    }
}

impl OutcomeSink for ConnectionLifecycle {
    fn connect_succeeded(&self, id: DeviceId, port: u16) {
        let old_scan = {
            let mut state = self.lock();
            match state.target {
                ActiveTarget::Scanning { device, .. } if device == id => {
                    state.target = ActiveTarget::Connected { device: id, port };
                    state.scan.take()
                }
                _ => {
                    debug!("Ignoring stale connection success for device {}", id);
                    return;
                }
            }
        };
        if let Some(scan) = old_scan {
            scan.stop();
        }
        info!("Connected to device {} on port {}", id, port);
    }

    fn connect_failed(&self, id: DeviceId, port: u16, cause: MuxError) {
        let old_scan = {
            let mut state = self.lock();
            match state.target {
                ActiveTarget::Scanning { device, .. } if device == id => {
                    state.target = ActiveTarget::Idle;
                    state.scan.take()
                }
                _ => {
                    debug!("Ignoring stale connection failure for device {}", id);
                    return;
                }
            }
        };
        if let Some(scan) = old_scan {
            scan.stop();
        }
        warn!(
            "Connection to device {} on port {} failed: {}",
            id, port, cause
        );
        self.schedule_fallback();
    }

    fn connection_lost(&self, id: DeviceId, port: u16) {
        {
            let mut state = self.lock();
            match state.target {
                ActiveTarget::Connected { device, .. } if device == id => {
                    state.target = ActiveTarget::Idle;
                }
                _ => {
                    debug!("Ignoring disconnect for non-target device {}", id);
                    return;
                }
            }
        }
        info!("Connection to device {} on port {} lost", id, port);
        self.schedule_fallback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mux::DiscoveryHandle;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const PORT: u16 = 29173;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum MuxCall {
        Scan { device: DeviceId, port: u16 },
        Send { payload: Vec<u8>, channel: u32 },
    }

    #[derive(Default)]
    struct FakeMux {
        calls: Mutex<Vec<MuxCall>>,
        scan_stops: Arc<AtomicUsize>,
    }

    impl FakeMux {
        fn calls(&self) -> Vec<MuxCall> {
            self.calls.lock().unwrap().clone()
        }

        fn scans(&self) -> Vec<MuxCall> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, MuxCall::Scan { .. }))
                .collect()
        }

        fn sends(&self) -> Vec<MuxCall> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, MuxCall::Send { .. }))
                .collect()
        }

        fn stops(&self) -> usize {
            self.scan_stops.load(Ordering::SeqCst)
        }
    }

    struct FakeScan {
        stops: Arc<AtomicUsize>,
        stopped: AtomicBool,
    }

    impl ScanHandle for FakeScan {
        fn stop(&self) {
            if !self.stopped.swap(true, Ordering::SeqCst) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct FakeDiscovery;

    impl DiscoveryHandle for FakeDiscovery {
        fn stop(&self) {}
    }

    impl DeviceMux for FakeMux {
        fn start_discovery(
            &self,
            _sink: Arc<dyn PresenceSink>,
        ) -> Result<Box<dyn DiscoveryHandle>, MuxError> {
            Ok(Box::new(FakeDiscovery))
        }

        fn start_scan(
            &self,
            _sink: Arc<dyn OutcomeSink>,
            device: DeviceId,
            port: u16,
        ) -> Result<Box<dyn ScanHandle>, MuxError> {
            self.calls
                .lock()
                .unwrap()
                .push(MuxCall::Scan { device, port });
            Ok(Box::new(FakeScan {
                stops: self.scan_stops.clone(),
                stopped: AtomicBool::new(false),
            }))
        }

        fn send(&self, payload: &[u8], channel: u32) -> Result<(), MuxError> {
            self.calls.lock().unwrap().push(MuxCall::Send {
                payload: payload.to_vec(),
                channel,
            });
            Ok(())
        }

        fn close(&self) {}
    }

    fn device(id: DeviceId) -> Device {
        Device {
            id,
            serial: format!("SER{id:04}"),
            product_id: None,
            location: None,
        }
    }

    fn lifecycle(mux: &Arc<FakeMux>, backoff: Duration) -> ConnectionLifecycle {
        ConnectionLifecycle::new(
            mux.clone(),
            LifecycleConfig {
                device_port: PORT,
                probe_channel: 1,
                rescan_backoff: backoff,
            },
        )
    }

    #[test]
    fn test_attach_begins_scan() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(7));

        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 7,
                port: PORT
            }
        );
        assert_eq!(
            mux.scans(),
            vec![MuxCall::Scan {
                device: 7,
                port: PORT
            }]
        );
    }

    #[test]
    fn test_success_establishes_connection_and_stops_scan() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(7));
        machine.connect_succeeded(7, PORT);

        assert_eq!(
            machine.target(),
            ActiveTarget::Connected {
                device: 7,
                port: PORT
            }
        );
        assert_eq!(mux.stops(), 1);
    }

    #[test]
    fn test_stale_success_is_ignored() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(7));
        machine.connect_succeeded(9, PORT);

        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 7,
                port: PORT
            }
        );
        assert_eq!(mux.stops(), 0);
    }

    #[test]
    fn test_retarget_stops_previous_scan() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        machine.device_attached(device(2));

        // At most one scan outstanding: the first was stopped when the
        // second began.
        assert_eq!(mux.scans().len(), 2);
        assert_eq!(mux.stops(), 1);
        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 2,
                port: PORT
            }
        );
    }

    #[test]
    fn test_failure_falls_back_to_any_present_device() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        machine.device_attached(device(2));
        machine.connect_failed(2, PORT, MuxError::Refused("refused".to_string()));

        match machine.target() {
            ActiveTarget::Scanning { device, port } => {
                assert!([1, 2].contains(&device));
                assert_eq!(port, PORT);
            }
            other => panic!("expected fallback scan, got {other:?}"),
        }
        assert_eq!(mux.scans().len(), 3);
    }

    #[test]
    fn test_lost_connection_falls_back() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(5));
        machine.connect_succeeded(5, PORT);
        machine.connection_lost(5, PORT);

        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 5,
                port: PORT
            }
        );
    }

    #[test]
    fn test_stale_failure_and_loss_are_ignored() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(5));
        machine.connect_failed(8, PORT, MuxError::Refused("refused".to_string()));
        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 5,
                port: PORT
            }
        );

        machine.connection_lost(5, PORT);
        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 5,
                port: PORT
            }
        );
    }

    #[test]
    fn test_detach_of_target_goes_idle() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(3));
        machine.device_detached(3);

        assert_eq!(machine.target(), ActiveTarget::Idle);
        assert_eq!(mux.stops(), 1);
        // No fallback scan on detach.
        assert_eq!(mux.scans().len(), 1);
    }

    #[test]
    fn test_detach_of_non_target_keeps_scan() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        machine.device_attached(device(2));
        machine.device_detached(1);

        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 2,
                port: PORT
            }
        );
        // Only the retarget stop, none from the detach.
        assert_eq!(mux.stops(), 1);
    }

    #[test]
    fn test_discovery_error_abandons_cycle_without_retry() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(4));
        machine.discovery_error(MuxError::UnknownMessage(99));

        assert_eq!(machine.target(), ActiveTarget::Idle);
        assert_eq!(mux.stops(), 1);
        assert_eq!(mux.scans().len(), 1);
    }

    #[test]
    fn test_forward_without_connection_is_no_active_target() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        let err = machine.forward(b"payload", 106).unwrap_err();
        assert!(matches!(err, ForwardError::NoActiveTarget));
        assert!(mux.sends().is_empty());

        // The machine stays usable: a later connection accepts traffic.
        machine.device_attached(device(1));
        machine.connect_succeeded(1, PORT);
        machine.forward(b"payload", 106).unwrap();
    }

    #[test]
    fn test_forward_sends_exactly_one_tagged_payload() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        machine.connect_succeeded(1, PORT);
        machine.forward(b"\x00\x01binary", 106).unwrap();

        assert_eq!(
            mux.sends(),
            vec![MuxCall::Send {
                payload: b"\x00\x01binary".to_vec(),
                channel: 106
            }]
        );
    }

    #[test]
    fn test_attach_while_connected_probes_and_retargets() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        machine.connect_succeeded(1, PORT);
        machine.device_attached(device(2));

        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 2,
                port: PORT
            }
        );
        assert_eq!(
            mux.sends(),
            vec![MuxCall::Send {
                payload: LIVENESS_PROBE.to_vec(),
                channel: 1
            }]
        );
    }

    #[test]
    fn test_attach_while_idle_does_not_probe() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        assert!(mux.sends().is_empty());
    }

    #[test]
    fn test_stop_scan_is_idempotent() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::ZERO);

        machine.device_attached(device(1));
        machine.stop_scan();
        machine.stop_scan();

        assert_eq!(mux.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_fallback_scan() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::from_millis(500));

        machine.device_attached(device(1));
        machine.connect_failed(1, PORT, MuxError::Refused("refused".to_string()));

        // Cleared immediately, rescan deferred.
        assert_eq!(machine.target(), ActiveTarget::Idle);
        assert_eq!(mux.scans().len(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(machine.target(), ActiveTarget::Idle);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            machine.target(),
            ActiveTarget::Scanning {
                device: 1,
                port: PORT
            }
        );
        assert_eq!(mux.scans().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_rescan_skips_departed_devices() {
        let mux = Arc::new(FakeMux::default());
        let machine = lifecycle(&mux, Duration::from_millis(500));

        machine.device_attached(device(1));
        machine.connect_succeeded(1, PORT);
        machine.connection_lost(1, PORT);
        machine.device_detached(1);

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(machine.target(), ActiveTarget::Idle);
        assert_eq!(mux.scans().len(), 1);
    }
}
