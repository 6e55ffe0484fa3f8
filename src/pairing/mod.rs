//! Application pairing.
//!
//! A pairing is the trust relationship between one external application
//! and the local wallet: an API key the application presents on every
//! bridge call. Records persist across restarts and are never deleted
//! automatically.

mod store;

pub use store::{PairingRecord, PairingStore, PairingType, generate_api_key};
