//! KeyBridge: a local companion service for a hardware signing device.
//!
//! Untrusted web applications and dApps talk to the bridge; the bridge
//! talks to the device. Every signing request is explicitly approved by
//! the device owner before it reaches the hardware, and the device never
//! runs more than one operation at a time.
//!
//! # Architecture
//!
//! ```text
//! external caller ─▶ (BridgeServer | ProtocolAdapter)
//!                          │
//!                          ▼
//!                    ApprovalQueue ──▶ human decision
//!                          │
//!                          ▼
//!                 DeviceStateController ──▶ device
//! ```
//!
//! The approval queue is the only shared mutable structure; the device
//! handle is exclusively owned by the state controller. The presentation
//! layer consumes the queue's event feed and calls
//! [`ApprovalQueue::decide`](approval::ApprovalQueue::decide), its sole
//! mutation point.

pub mod approval;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod pairing;
pub mod server;
pub mod walletconnect;

pub use approval::{ApprovalQueue, Decision, PendingRequest, QueueConfig};
pub use config::BridgeConfig;
pub use device::{DeviceState, DeviceStateController};
pub use error::{Error, Result};
pub use pairing::{PairingRecord, PairingStore, PairingType};
pub use server::{AppState, BridgeServer, BridgeServerConfig};
pub use walletconnect::ProtocolAdapter;
