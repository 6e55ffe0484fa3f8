//! Durable store of paired applications.
//!
//! Records are unique by `(service_name, service_home_page, pairing_type)`;
//! a repeated pairing attempt from the same service refreshes the existing
//! record instead of minting a second credential. Backed by a JSON file so
//! pairings survive restarts, with an in-memory mode for tests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::error::PairingError;

/// Which ingress protocol established the pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingType {
    /// Paired directly against the bridge server's API.
    Direct,
    /// Paired through a legacy wallet-connection session.
    WalletConnect,
}

impl std::fmt::Display for PairingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingType::Direct => write!(f, "direct"),
            PairingType::WalletConnect => write!(f, "walletconnect"),
        }
    }
}

/// One paired application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRecord {
    /// Opaque caller-presented credential. Unique across records.
    pub api_key: String,
    pub service_name: String,
    pub service_home_page: String,
    pub service_image_url: Option<String>,
    pub pairing_type: PairingType,
    /// When the pairing was first established. Survives re-negotiation.
    pub added_on: DateTime<Utc>,
}

impl PairingRecord {
    fn same_identity(&self, name: &str, home_page: &str, pairing_type: PairingType) -> bool {
        self.service_name == name
            && self.service_home_page == home_page
            && self.pairing_type == pairing_type
    }
}

/// Generate a fresh API key: 32 random bytes, hex-encoded.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Store of pairing records.
///
/// The write lock is held across the disk write, so concurrent pairing
/// attempts for the same identity cannot race-create duplicates.
pub struct PairingStore {
    path: Option<PathBuf>,
    records: RwLock<Vec<PairingRecord>>,
}

impl PairingStore {
    /// A store that never touches disk. For tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Open (or create) a store backed by the given JSON file.
    ///
    /// A missing file is an empty store; a corrupt file is an error rather
    /// than silent data loss.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PairingError> {
        let path = path.into();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    /// Default store location under the user's home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keybridge")
            .join("pairings.json")
    }

    /// Create or refresh the pairing for a service.
    ///
    /// An existing record keeps its `api_key` and `added_on` and refreshes
    /// the image URL; a new record gets a fresh key. Returns the stored
    /// record either way.
    pub async fn upsert(
        &self,
        service_name: &str,
        service_home_page: &str,
        service_image_url: Option<&str>,
        pairing_type: PairingType,
    ) -> Result<PairingRecord, PairingError> {
        let mut records = self.records.write().await;

        let record = if let Some(existing) = records
            .iter_mut()
            .find(|r| r.same_identity(service_name, service_home_page, pairing_type))
        {
            existing.service_image_url = service_image_url.map(str::to_string);
            existing.clone()
        } else {
            let record = PairingRecord {
                api_key: generate_api_key(),
                service_name: service_name.to_string(),
                service_home_page: service_home_page.to_string(),
                service_image_url: service_image_url.map(str::to_string),
                pairing_type,
                added_on: Utc::now(),
            };
            records.push(record.clone());
            tracing::info!(service = service_name, %pairing_type, "new application paired");
            record
        };

        self.persist(&records)?;
        Ok(record)
    }

    /// Point lookup by pairing identity.
    pub async fn find(
        &self,
        service_name: &str,
        service_home_page: &str,
        pairing_type: PairingType,
    ) -> Option<PairingRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.same_identity(service_name, service_home_page, pairing_type))
            .cloned()
    }

    /// Resolve an API key to its pairing record.
    ///
    /// Comparison is constant-time per record so key validation does not
    /// leak prefix length.
    pub async fn authorize(&self, api_key: &str) -> Result<PairingRecord, PairingError> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| bool::from(r.api_key.as_bytes().ct_eq(api_key.as_bytes())))
            .cloned()
            .ok_or(PairingError::UnknownApiKey)
    }

    /// All pairings, oldest first.
    pub async fn list(&self) -> Vec<PairingRecord> {
        let mut records: Vec<PairingRecord> = self.records.read().await.iter().cloned().collect();
        records.sort_by(|a, b| a.added_on.cmp(&b.added_on));
        records
    }

    /// Revoke a pairing by API key. Not reachable from the paired API;
    /// only the local owner can call this.
    pub async fn remove(&self, api_key: &str) -> Result<PairingRecord, PairingError> {
        let mut records = self.records.write().await;
        let index = records
            .iter()
            .position(|r| r.api_key == api_key)
            .ok_or(PairingError::UnknownApiKey)?;
        let removed = records.remove(index);
        self.persist(&records)?;
        Ok(removed)
    }

    fn persist(&self, records: &[PairingRecord]) -> Result<(), PairingError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomically(path, &serde_json::to_vec_pretty(records)?)?;
        Ok(())
    }
}

/// Write via a temp file + rename so a crash mid-write cannot truncate
/// the pairing database.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
