//! Key records and one-time source loading
//!
//! The key file is read exactly once at process start; membership is fixed
//! for the process lifetime. Runtime state (status transitions, usage
//! counts) lives in the pool and is never written back here — a restart
//! resets every key to its configured initial state. Anyone replacing this
//! loader with a persistent store must take over that write-back.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Configured availability of a key.
///
/// `Inactive` keys stay in the ring (order is load order) but are never
/// selected. The file may seed a key as `inactive` to park it without
/// deleting the entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Inactive,
}

/// Per-key quota settings.
///
/// `rpm_limit` is the requests-per-minute ceiling enforced by the pool's
/// token bucket. `used_count` seeds the informational usage counter; it is
/// bookkeeping only, not an enforcement input.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyQuota {
    pub rpm_limit: u32,
    #[serde(default)]
    pub used_count: u64,
}

/// One API key entry from the source file.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyRecord {
    /// The key material itself - also the record's identity.
    pub key: Secret<String>,
    #[serde(default)]
    pub status: KeyStatus,
    pub quota: KeyQuota,
}

/// Top-level shape of the key file.
#[derive(Deserialize)]
struct KeyFile {
    api_keys: Vec<KeyRecord>,
}

/// The ordered key list, loaded once at startup.
///
/// File order is the pool's rotation order, so it is preserved as read.
#[derive(Debug)]
pub struct KeyStore {
    records: Vec<KeyRecord>,
}

impl KeyStore {
    /// Load and validate the key file.
    ///
    /// Unlike a cache or a credential vault there is no cold-start path: a
    /// missing or empty file is an error, since a pool with zero keys can
    /// never serve a request.
    ///
    /// Expected shape:
    ///
    /// ```json
    /// {
    ///   "api_keys": [
    ///     { "key": "...", "status": "active",
    ///       "quota": { "rpm_limit": 60, "used_count": 0 } }
    ///   ]
    /// }
    /// ```
    ///
    /// `status` defaults to `active` and `used_count` to `0` when absent.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(format!("reading key file {}: {e}", path.display())))?;
        let file: KeyFile = serde_json::from_str(&contents)
            .map_err(|e| Error::Parse(format!("parsing key file {}: {e}", path.display())))?;

        let store = Self::from_records(file.api_keys)?;
        info!(path = %path.display(), keys = store.len(), "loaded key file");
        Ok(store)
    }

    /// Build a store from already-parsed records, applying the same
    /// validation as `load`.
    pub fn from_records(records: Vec<KeyRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::Invalid("key file contains no API keys".into()));
        }
        for (i, record) in records.iter().enumerate() {
            if record.quota.rpm_limit == 0 {
                return Err(Error::Invalid(format!(
                    "key {} ({}) has rpm_limit 0, which can never admit a request",
                    i,
                    record.key.masked()
                )));
            }
        }
        for (i, record) in records.iter().enumerate() {
            let duplicate = records[..i]
                .iter()
                .any(|earlier| earlier.key.expose() == record.key.expose());
            if duplicate {
                return Err(Error::Invalid(format!(
                    "duplicate key material at entry {} ({})",
                    i,
                    record.key.masked()
                )));
            }
        }
        Ok(Self { records })
    }

    /// The records in file order.
    pub fn records(&self) -> &[KeyRecord] {
        &self.records
    }

    /// Consume the store, yielding the records for pool construction.
    pub fn into_records(self) -> Vec<KeyRecord> {
        self.records
    }

    /// Number of loaded keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no keys. Always false for a store that
    /// passed validation.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
