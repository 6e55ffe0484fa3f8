//! Device connection lifecycle.
//!
//! The controller owns the transport handle and is the only component that
//! mutates connection state or addresses the device. State changes are
//! broadcast to subscribers with an explicit initial-state replay, and a
//! single operation lock serializes every device round trip.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::device::transport::{Detection, DeviceOperation, DeviceTransport};
use crate::error::DeviceError;

/// Connection state of the physical signing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// No device on the bus.
    Disconnected,
    /// Device claimed and ready for signing operations.
    Connected,
    /// Device present but the interface claim failed (held elsewhere, or a
    /// transient USB/HID error). Distinct from absence so callers can tell
    /// "unplug and retry" from "another process holds it".
    HardwareError,
    /// Device physically present but not yet initialized for signing.
    Plugin,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::Connected => "CONNECTED",
            DeviceState::HardwareError => "HARDWARE_ERROR",
            DeviceState::Plugin => "PLUGIN",
        };
        write!(f, "{}", s)
    }
}

/// A single state transition, as delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: DeviceState,
    pub current: DeviceState,
}

/// Owns the device transport and its connection state machine.
pub struct DeviceStateController {
    transport: Arc<dyn DeviceTransport>,
    /// Current state; `watch` gives waiters the value without racing events.
    state: watch::Sender<DeviceState>,
    /// Transition feed for subscribers (presentation layer, adapter).
    events: broadcast::Sender<StateChange>,
    /// Serializes transitions so snapshots and event order are consistent.
    transition_lock: Mutex<()>,
    /// The one hard mutual-exclusion invariant: at most one device round
    /// trip at a time, reads included.
    op_lock: Mutex<()>,
}

impl DeviceStateController {
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        let (state, _) = watch::channel(DeviceState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            state,
            events,
            transition_lock: Mutex::new(()),
            op_lock: Mutex::new(()),
        }
    }

    /// The current connection state.
    pub fn current_state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    ///
    /// Returns the state at subscription time together with the event
    /// receiver, so late subscribers still learn where things stand before
    /// the first transition they observe.
    pub async fn subscribe(&self) -> (DeviceState, broadcast::Receiver<StateChange>) {
        let _guard = self.transition_lock.lock().await;
        (*self.state.borrow(), self.events.subscribe())
    }

    /// Detect the device and update state accordingly.
    ///
    /// Present + initialized attempts an exclusive interface claim:
    /// success is `Connected`, failure is `HardwareError`. Present but not
    /// initialized is `Plugin`. Absent is `Disconnected` (and drops any
    /// held claim). A failed claim is reported, not retried here; the
    /// probe loop or caller decides whether to probe again.
    pub async fn probe(&self) -> DeviceState {
        let next = match self.transport.detect().await {
            Detection::Absent => {
                self.transport.release().await;
                DeviceState::Disconnected
            }
            Detection::Present { initialized: false } => DeviceState::Plugin,
            Detection::Present { initialized: true } => {
                if self.current_state() == DeviceState::Connected {
                    DeviceState::Connected
                } else {
                    match self.transport.claim().await {
                        Ok(()) => DeviceState::Connected,
                        Err(err) => {
                            tracing::warn!(error = %err, "device claim failed");
                            DeviceState::HardwareError
                        }
                    }
                }
            }
        };
        self.transition(next).await;
        next
    }

    /// Announce a state. Re-announcing the identical state is a no-op:
    /// subscribers never see duplicate consecutive events.
    async fn transition(&self, next: DeviceState) {
        let _guard = self.transition_lock.lock().await;
        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        self.state.send_replace(next);
        tracing::info!(%previous, current = %next, "device state changed");
        let _ = self.events.send(StateChange {
            previous,
            current: next,
        });
    }

    /// Wait until the device reports `Connected`.
    ///
    /// Resolves immediately if already connected. Callers bound the wait
    /// with their own timeout policy.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == DeviceState::Connected {
                return;
            }
            if rx.changed().await.is_err() {
                // Controller dropped; nothing will ever connect.
                std::future::pending::<()>().await;
            }
        }
    }

    /// The account the device exposes for a chain.
    ///
    /// Read-only, so no approval gate, but still serialized with all other
    /// device work: the hardware is single-threaded.
    pub async fn exposed_account(&self, chain_id: u64) -> Result<String, DeviceError> {
        let _op = self.op_lock.lock().await;
        let state = self.current_state();
        if state != DeviceState::Connected {
            return Err(DeviceError::Unavailable { state });
        }
        self.transport.account(chain_id).await
    }

    /// Execute one operation against the device.
    ///
    /// Requires `Connected`. A detach while the operation is in flight
    /// cancels it with [`DeviceError::Disconnected`]; the operation is
    /// never retried here.
    pub async fn execute(&self, op: &DeviceOperation) -> Result<Value, DeviceError> {
        let _op_guard = self.op_lock.lock().await;

        // Watch for a disconnect before checking state so a transition
        // between the check and the transport call is still observed.
        let mut state_rx = self.state.subscribe();
        let state = *state_rx.borrow_and_update();
        if state != DeviceState::Connected {
            return Err(DeviceError::Unavailable { state });
        }

        tracing::debug!(method = %op.method, coin = ?op.coin, "executing device operation");

        tokio::select! {
            result = self.transport.execute(op) => result,
            _ = async {
                loop {
                    if state_rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                    if *state_rx.borrow() != DeviceState::Connected {
                        break;
                    }
                }
            } => {
                tracing::warn!(method = %op.method, "device detached mid-operation");
                Err(DeviceError::Disconnected)
            }
        }
    }

    /// Spawn the device-event listener: a periodic probe driving
    /// attach/detach/claim transitions until the controller is dropped.
    pub fn spawn_probe_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.probe().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transport::SimulatedDevice;
    use serde_json::json;

    fn controller_with_device() -> (Arc<DeviceStateController>, Arc<SimulatedDevice>) {
        let device = Arc::new(SimulatedDevice::new());
        let transport: Arc<dyn DeviceTransport> = device.clone();
        (Arc::new(DeviceStateController::new(transport)), device)
    }

    fn sign_op() -> DeviceOperation {
        DeviceOperation::new(None, "personal_sign", json!(["deadbeef"]))
    }

    #[test]
    fn test_state_display_matches_wire_names() {
        assert_eq!(DeviceState::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(DeviceState::Connected.to_string(), "CONNECTED");
        assert_eq!(DeviceState::HardwareError.to_string(), "HARDWARE_ERROR");
        assert_eq!(DeviceState::Plugin.to_string(), "PLUGIN");
    }

    #[test]
    fn test_state_serde_screaming_snake_case() {
        let json = serde_json::to_string(&DeviceState::HardwareError).unwrap();
        assert_eq!(json, "\"HARDWARE_ERROR\"");
        let state: DeviceState = serde_json::from_str("\"PLUGIN\"").unwrap();
        assert_eq!(state, DeviceState::Plugin);
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let (controller, _device) = controller_with_device();
        assert_eq!(controller.current_state(), DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn test_probe_claims_present_device() {
        let (controller, device) = controller_with_device();
        assert_eq!(controller.probe().await, DeviceState::Connected);
        assert!(device.is_claimed());
    }

    #[tokio::test]
    async fn test_probe_absent_device() {
        let (controller, device) = controller_with_device();
        device.set_detection(Detection::Absent);
        assert_eq!(controller.probe().await, DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn test_probe_uninitialized_device_is_plugin() {
        let (controller, device) = controller_with_device();
        device.set_detection(Detection::Present { initialized: false });
        assert_eq!(controller.probe().await, DeviceState::Plugin);
    }

    #[tokio::test]
    async fn test_claim_failure_is_hardware_error_not_disconnected() {
        let (controller, device) = controller_with_device();
        device.deny_claims(Some("interface held by another process"));
        assert_eq!(controller.probe().await, DeviceState::HardwareError);

        // Once the other process lets go, a re-probe recovers.
        device.deny_claims(None);
        assert_eq!(controller.probe().await, DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_subscribe_replays_current_state() {
        let (controller, _device) = controller_with_device();
        controller.probe().await;

        let (state, _rx) = controller.subscribe().await;
        assert_eq!(state, DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_transitions_fire_one_event_each() {
        let (controller, device) = controller_with_device();
        let (initial, mut rx) = controller.subscribe().await;
        assert_eq!(initial, DeviceState::Disconnected);

        controller.probe().await;
        let change = rx.recv().await.unwrap();
        assert_eq!(change.previous, DeviceState::Disconnected);
        assert_eq!(change.current, DeviceState::Connected);

        device.set_detection(Detection::Absent);
        controller.probe().await;
        let change = rx.recv().await.unwrap();
        assert_eq!(change.previous, DeviceState::Connected);
        assert_eq!(change.current, DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn test_repeated_identical_state_emits_no_duplicate_events() {
        let (controller, _device) = controller_with_device();
        let (_, mut rx) = controller.subscribe().await;

        controller.probe().await;
        controller.probe().await;
        controller.probe().await;

        // Exactly one transition happened.
        rx.recv().await.unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_execute_requires_connected() {
        let (controller, _device) = controller_with_device();
        let err = controller.execute(&sign_op()).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Unavailable {
                state: DeviceState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_execute_returns_artifact_when_connected() {
        let (controller, _device) = controller_with_device();
        controller.probe().await;

        let artifact = controller.execute(&sign_op()).await.unwrap();
        assert!(artifact.as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_detach_cancels_in_flight_operation() {
        let (controller, device) = controller_with_device();
        controller.probe().await;
        device.hold_operations();

        let c = Arc::clone(&controller);
        let handle = tokio::spawn(async move { c.execute(&sign_op()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        device.set_detection(Detection::Absent);
        controller.probe().await;

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled operation should resolve")
            .unwrap();
        assert!(matches!(result, Err(DeviceError::Disconnected)));
    }

    #[tokio::test]
    async fn test_exposed_account_requires_connected() {
        let (controller, _device) = controller_with_device();
        assert!(controller.exposed_account(1).await.is_err());

        controller.probe().await;
        let account = controller.exposed_account(1).await.unwrap();
        assert!(account.starts_with("0x"));
    }

    #[tokio::test]
    async fn test_wait_until_connected_resolves_on_probe() {
        let (controller, _device) = controller_with_device();

        let c = Arc::clone(&controller);
        let waiter = tokio::spawn(async move { c.wait_until_connected().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        controller.probe().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve once connected")
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_loop_tracks_attach_and_detach() {
        let (controller, device) = controller_with_device();
        device.set_detection(Detection::Absent);
        let loop_handle = Arc::clone(&controller).spawn_probe_loop(Duration::from_millis(10));

        let (_, mut rx) = controller.subscribe().await;

        device.set_detection(Detection::Present { initialized: true });
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("attach should be observed")
            .unwrap();
        assert_eq!(change.current, DeviceState::Connected);

        device.set_detection(Detection::Absent);
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("detach should be observed")
            .unwrap();
        assert_eq!(change.current, DeviceState::Disconnected);

        loop_handle.abort();
    }
}
