//! Session state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ProtocolError;
use crate::walletconnect::types::PeerMetadata;

/// Lifecycle of one dApp connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Inbound session request received, account not yet resolved.
    Proposed,
    /// Connection approved with the device's exposed account.
    Approved,
    /// The dApp confirmed the connection; call requests flow.
    Active,
    /// Terminal. Explicit disconnect or device-driven.
    Disconnected,
}

impl SessionState {
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Proposed, Approved)
                | (Approved, Active)
                | (Proposed, Disconnected)
                | (Approved, Disconnected)
                | (Active, Disconnected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// One live connection to an external dApp.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub topic: String,
    pub chain_id: u64,
    /// Addresses exposed to the dApp.
    pub accounts: Vec<String>,
    pub peer_meta: PeerMetadata,
    pub state: SessionState,
    pub proposed_at: DateTime<Utc>,
}

impl Session {
    pub fn proposed(topic: impl Into<String>, chain_id: u64, peer_meta: PeerMetadata) -> Self {
        Self {
            topic: topic.into(),
            chain_id,
            accounts: Vec::new(),
            peer_meta,
            state: SessionState::Proposed,
            proposed_at: Utc::now(),
        }
    }

    /// Advance the session, refusing invalid transitions.
    pub fn transition(&mut self, target: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(target) {
            return Err(ProtocolError::InvalidSessionState {
                topic: self.topic.clone(),
                state: self.state.to_string(),
                expected: target.to_string(),
            });
        }
        tracing::debug!(topic = %self.topic, from = %self.state, to = %target, "session transition");
        self.state = target;
        Ok(())
    }
}
