//! Hardware signing device: transport seam and connection lifecycle.
//!
//! The device handle is exclusively owned by [`DeviceStateController`];
//! every other component goes through its operation surface.

mod controller;
mod transport;

pub use controller::{DeviceState, DeviceStateController, StateChange};
pub use transport::{Detection, DeviceOperation, DeviceTransport, SimulatedDevice};
