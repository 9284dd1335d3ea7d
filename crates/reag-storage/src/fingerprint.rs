use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reag_core::{CanonicalPropertyRecord, Fingerprint, ValidationError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("listing already stored: {0}")]
    Duplicate(Fingerprint),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Persisted listings keyed by `(source name, source URL)`.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Validate and persist. A record whose fingerprint is already stored is rejected
    /// with [`StoreError::Duplicate`].
    async fn insert(&self, record: CanonicalPropertyRecord) -> Result<CanonicalPropertyRecord, StoreError>;

    async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    /// Delete every record, returning how many were removed.
    async fn clear(&self) -> Result<u64, StoreError>;
}

/// Stable hex key for a fingerprint, used as the database primary key.
pub fn fingerprint_digest(fingerprint: &Fingerprint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.source_name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(fingerprint.source_url.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    records: Mutex<HashMap<Fingerprint, CanonicalPropertyRecord>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CanonicalPropertyRecord> {
        self.records.lock().await.get(fingerprint).cloned()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.contains_key(fingerprint))
    }

    async fn insert(&self, record: CanonicalPropertyRecord) -> Result<CanonicalPropertyRecord, StoreError> {
        record.validate()?;
        let fingerprint = record.fingerprint();
        let mut records = self.records.lock().await;
        if records.contains_key(&fingerprint) {
            return Err(StoreError::Duplicate(fingerprint));
        }
        records.insert(fingerprint, record.clone());
        Ok(record)
    }

    async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let records = self.records.lock().await;
        let mut counts = BTreeMap::new();
        for fingerprint in records.keys() {
            *counts.entry(fingerprint.source_name.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }
}
