//! Wire shapes for the legacy wallet-connection protocol.
//!
//! Inbound payloads carry a numeric id, a method name, and a parameter
//! array; outbound payloads either approve with a result or reject with
//! an error message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Metadata a dApp presents about itself during session negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetadata {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icons: Vec<String>,
}

/// An inbound request to open a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    pub topic: String,
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub peer_meta: PeerMetadata,
}

/// The adapter's answer to a session proposal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionApproval {
    pub chain_id: u64,
    pub accounts: Vec<String>,
}

/// An inbound call request on an active session.
#[derive(Debug, Clone, Deserialize)]
pub struct CallRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Error payload of a rejected call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
}

/// Response routed back to the dApp for one call request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CallOutcome {
    Approval { id: u64, result: Value },
    Rejection { id: u64, error: RpcError },
}

impl CallOutcome {
    pub fn approved(id: u64, result: Value) -> Self {
        CallOutcome::Approval { id, result }
    }

    pub fn rejected(id: u64, message: impl Into<String>) -> Self {
        CallOutcome::Rejection {
            id,
            error: RpcError {
                message: message.into(),
            },
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            CallOutcome::Approval { id, .. } | CallOutcome::Rejection { id, .. } => *id,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, CallOutcome::Approval { .. })
    }
}

/// Call-request methods the adapter can translate into device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMethod {
    PersonalSign,
    EthSendTransaction,
    EthSignTransaction,
    EthSignTypedData,
    SwitchChain,
}

impl CallMethod {
    /// Map a wire method name; `None` means the method is unsupported and
    /// must be rejected without queueing.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "personal_sign" => Some(CallMethod::PersonalSign),
            "eth_sendTransaction" => Some(CallMethod::EthSendTransaction),
            "eth_signTransaction" => Some(CallMethod::EthSignTransaction),
            "eth_signTypedData" => Some(CallMethod::EthSignTypedData),
            "wallet_switchEthereumChain" => Some(CallMethod::SwitchChain),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallMethod::PersonalSign => "personal_sign",
            CallMethod::EthSendTransaction => "eth_sendTransaction",
            CallMethod::EthSignTransaction => "eth_signTransaction",
            CallMethod::EthSignTypedData => "eth_signTypedData",
            CallMethod::SwitchChain => "wallet_switchEthereumChain",
        }
    }
}

/// Parse the first parameter of a chain-switch request.
///
/// `chainId` arrives either as a hex string (`"0x89"`) or a bare number;
/// an optional `accounts` array accompanies it.
pub fn parse_switch_chain(params: &[Value]) -> Result<(u64, Option<Vec<String>>), ProtocolError> {
    let first = params
        .first()
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::MalformedPayload {
            reason: "chain switch expects an object parameter".to_string(),
        })?;

    let chain_id = match first.get("chainId") {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| ProtocolError::MalformedPayload {
            reason: "chainId out of range".to_string(),
        })?,
        Some(Value::String(s)) => {
            let digits = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(digits, 16).map_err(|_| ProtocolError::MalformedPayload {
                reason: format!("chainId is not a hex number: {s}"),
            })?
        }
        _ => {
            return Err(ProtocolError::MalformedPayload {
                reason: "missing chainId".to_string(),
            });
        }
    };

    let accounts = first.get("accounts").map(|value| {
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    });

    Ok((chain_id, accounts))
}
