//! Device transport abstraction.
//!
//! The hardware signer is an opaque capability behind [`DeviceTransport`]:
//! detect presence, claim the communication interface, run one operation.
//! The controller owns the only handle; nothing else talks to the device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeviceError;

/// Result of probing for the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// No device on the bus.
    Absent,
    /// Device is physically present. `initialized` is false while the
    /// device still needs firmware interaction before it can sign.
    Present { initialized: bool },
}

/// One unit of work for the device.
///
/// The queue and the wire layers treat `params` as opaque; only the
/// transport interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOperation {
    /// Coin or chain the operation targets, when the caller knows it.
    pub coin: Option<String>,
    /// Signing operation kind, e.g. `personal_sign` or `sign_transaction`.
    pub method: String,
    /// Raw input parameters, passed through untouched.
    pub params: Value,
}

impl DeviceOperation {
    pub fn new(coin: Option<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            coin,
            method: method.into(),
            params,
        }
    }
}

/// Transport to a single physically-attached signing device.
///
/// Implementations must tolerate concurrent `detect` calls but may assume
/// `claim`/`execute`/`account` are externally serialized (the controller
/// guarantees it).
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Probe the bus for the device.
    async fn detect(&self) -> Detection;

    /// Exclusively acquire the device's communication interface.
    async fn claim(&self) -> std::result::Result<(), DeviceError>;

    /// Drop the interface claim, if held.
    async fn release(&self);

    /// The account the device exposes for a chain. Read-only; requires a
    /// held claim but no user approval.
    async fn account(&self, chain_id: u64) -> std::result::Result<String, DeviceError>;

    /// Perform one signing operation and return the artifact.
    async fn execute(&self, op: &DeviceOperation) -> std::result::Result<Value, DeviceError>;
}

/// In-process stand-in for a real device.
///
/// Presence, claimability, and operation outcomes are scriptable so tests
/// (and `serve --simulate`) can drive every state transition without
/// hardware. Operations can be held open to exercise in-flight cancellation.
pub struct SimulatedDevice {
    inner: std::sync::Mutex<SimState>,
    /// While `true`, `execute` parks until flipped back.
    hold: tokio::sync::watch::Sender<bool>,
}

struct SimState {
    detection: Detection,
    claim_denied: Option<String>,
    claimed: bool,
    fail_next: Option<String>,
    executed: u64,
}

impl SimulatedDevice {
    /// A present, initialized, claimable device.
    pub fn new() -> Self {
        let (hold, _) = tokio::sync::watch::channel(false);
        Self {
            inner: std::sync::Mutex::new(SimState {
                detection: Detection::Present { initialized: true },
                claim_denied: None,
                claimed: false,
                fail_next: None,
                executed: 0,
            }),
            hold,
        }
    }

    /// A device that is not plugged in yet.
    pub fn unplugged() -> Self {
        let device = Self::new();
        device.set_detection(Detection::Absent);
        device
    }

    pub fn set_detection(&self, detection: Detection) {
        let mut state = self.inner.lock().unwrap();
        state.detection = detection;
        if detection == Detection::Absent {
            state.claimed = false;
        }
    }

    /// Make subsequent claims fail with the given reason (e.g. interface
    /// held by another process), or succeed again when `None`.
    pub fn deny_claims(&self, reason: Option<&str>) {
        self.inner.lock().unwrap().claim_denied = reason.map(str::to_string);
    }

    /// Make the next `execute` call fail with a device-reported error.
    pub fn fail_next_operation(&self, reason: &str) {
        self.inner.lock().unwrap().fail_next = Some(reason.to_string());
    }

    /// Park subsequent `execute` calls until [`Self::release_operations`].
    pub fn hold_operations(&self) {
        let _ = self.hold.send(true);
    }

    pub fn release_operations(&self) {
        let _ = self.hold.send(false);
    }

    /// Number of operations the device has completed.
    pub fn executed_count(&self) -> u64 {
        self.inner.lock().unwrap().executed
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.lock().unwrap().claimed
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for SimulatedDevice {
    async fn detect(&self) -> Detection {
        self.inner.lock().unwrap().detection
    }

    async fn claim(&self) -> std::result::Result<(), DeviceError> {
        let mut state = self.inner.lock().unwrap();
        if state.detection == Detection::Absent {
            return Err(DeviceError::ClaimFailed {
                reason: "no device present".to_string(),
            });
        }
        if let Some(reason) = &state.claim_denied {
            return Err(DeviceError::ClaimFailed {
                reason: reason.clone(),
            });
        }
        state.claimed = true;
        Ok(())
    }

    async fn release(&self) {
        self.inner.lock().unwrap().claimed = false;
    }

    async fn account(&self, chain_id: u64) -> std::result::Result<String, DeviceError> {
        let state = self.inner.lock().unwrap();
        if !state.claimed {
            return Err(DeviceError::ClaimFailed {
                reason: "interface not claimed".to_string(),
            });
        }
        drop(state);
        Ok(format!(
            "0x{}",
            hex::encode(format!("simulated-account-{chain_id}"))
        ))
    }

    async fn execute(&self, op: &DeviceOperation) -> std::result::Result<Value, DeviceError> {
        // Park while a test holds operations open.
        let mut hold_rx = self.hold.subscribe();
        while *hold_rx.borrow_and_update() {
            if hold_rx.changed().await.is_err() {
                break;
            }
        }

        let mut state = self.inner.lock().unwrap();
        if let Some(reason) = state.fail_next.take() {
            return Err(DeviceError::Operation {
                method: op.method.clone(),
                reason,
            });
        }
        state.executed += 1;
        let sequence = state.executed;
        drop(state);

        Ok(Value::String(format!(
            "0x{}",
            hex::encode(format!("{}:{}", op.method, sequence))
        )))
    }
}
