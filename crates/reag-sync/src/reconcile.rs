use std::sync::Arc;

use chrono::Utc;
use reag_core::{CanonicalPropertyRecord, ScrapeBatchResult};
use reag_storage::{FingerprintStore, StoreError};
use tracing::{debug, info};
use uuid::Uuid;

/// Classifies canonical records against the fingerprint store. Records are handled one
/// at a time; a failure on one never affects its siblings.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn FingerprintStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, run_id: Uuid, city: &str, records: Vec<CanonicalPropertyRecord>) -> ScrapeBatchResult {
        let mut batch = ScrapeBatchResult::new(run_id, city, Utc::now());
        self.reconcile_into(records, &mut batch).await;
        batch.finished_at = Utc::now();
        batch
    }

    /// exists -> validate -> insert, accumulating outcomes into `batch`.
    pub async fn reconcile_into(&self, records: Vec<CanonicalPropertyRecord>, batch: &mut ScrapeBatchResult) {
        for record in records {
            let fingerprint = record.fingerprint();
            match self.store.exists(&fingerprint).await {
                Ok(true) => {
                    debug!(%fingerprint, "duplicate");
                    batch.record_duplicate();
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    batch.record_error(&fingerprint, format!("existence check failed: {err}"));
                    continue;
                }
            }
            if let Err(err) = record.validate() {
                debug!(%fingerprint, error = %err, "invalid record");
                batch.record_error(&fingerprint, err.to_string());
                continue;
            }
            match self.store.insert(record).await {
                Ok(stored) => {
                    debug!(%fingerprint, id = %stored.id, "created");
                    batch.record_created(&stored);
                }
                // Lost a race with a concurrent run; the store kept the other copy.
                Err(StoreError::Duplicate(_)) => batch.record_duplicate(),
                Err(err) => batch.record_error(&fingerprint, err.to_string()),
            }
        }
        info!(
            scraped = batch.counts.scraped,
            created = batch.counts.created,
            duplicates = batch.counts.duplicates,
            errors = batch.counts.errors,
            "reconciled batch"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use reag_core::{BatchErrorKind, Fingerprint, RawCandidateRecord};
    use reag_storage::MemoryFingerprintStore;

    use crate::normalize::{fallback_normalize, NormalizeContext};

    fn record(link: &str) -> CanonicalPropertyRecord {
        let candidate = RawCandidateRecord {
            title: "2 BHK Flat".into(),
            price_text: "₹80 Lakh".into(),
            source_link: Some(link.to_string()),
            ..Default::default()
        };
        fallback_normalize(
            &candidate,
            &NormalizeContext {
                source_name: "housing".into(),
                city: "Pune".into(),
                page_url: "https://housing.com/in/buy/pune/pune".into(),
                scraped_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn created_duplicate_and_invalid_are_classified() {
        let store = Arc::new(MemoryFingerprintStore::new());
        let reconciler = Reconciler::new(store.clone());

        let mut invalid = record("https://housing.com/p/3");
        invalid.confidence = 2.0;
        let batch = reconciler
            .reconcile(
                Uuid::new_v4(),
                "Pune",
                vec![
                    record("https://housing.com/p/1"),
                    record("https://housing.com/p/1"),
                    invalid,
                    record("https://housing.com/p/2"),
                ],
            )
            .await;

        assert_eq!(batch.counts.scraped, 4);
        assert_eq!(batch.counts.created, 2);
        assert_eq!(batch.counts.duplicates, 1);
        assert_eq!(batch.counts.errors, 1);
        assert_eq!(batch.errors[0].kind, BatchErrorKind::Record);
        assert_eq!(batch.errors[0].subject, "housing|https://housing.com/p/3");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn second_run_reports_duplicates_only() {
        let store = Arc::new(MemoryFingerprintStore::new());
        let reconciler = Reconciler::new(store);
        let first = reconciler
            .reconcile(Uuid::new_v4(), "Pune", vec![record("https://housing.com/p/9")])
            .await;
        let second = reconciler
            .reconcile(Uuid::new_v4(), "Pune", vec![record("https://housing.com/p/9")])
            .await;
        assert_eq!((first.counts.created, first.counts.duplicates), (1, 0));
        assert_eq!((second.counts.created, second.counts.duplicates), (0, 1));
    }

    #[tokio::test]
    async fn linkless_listings_with_a_shared_title_are_both_created() {
        let ctx = NormalizeContext {
            source_name: "housing".into(),
            city: "Pune".into(),
            page_url: "https://housing.com/in/buy/pune/pune".into(),
            scraped_at: Utc::now(),
        };
        let linkless = |price: &str, location: &str| {
            fallback_normalize(
                &RawCandidateRecord {
                    title: "2 BHK Apartment".into(),
                    price_text: price.into(),
                    location_text: location.into(),
                    ..Default::default()
                },
                &ctx,
            )
        };
        let store = Arc::new(MemoryFingerprintStore::new());
        let batch = Reconciler::new(store.clone())
            .reconcile(
                Uuid::new_v4(),
                "Pune",
                vec![linkless("₹50 Lakh", "Baner, Pune"), linkless("₹90 Lakh", "Kothrud, Pune")],
            )
            .await;

        assert_eq!(batch.counts.created, 2);
        assert_eq!(batch.counts.duplicates, 0);
        assert_eq!(store.len().await, 2);
    }

    /// Store whose existence check always misses, as when a concurrent run inserts
    /// between check and insert.
    struct RacingStore(MemoryFingerprintStore);

    #[async_trait]
    impl FingerprintStore for RacingStore {
        async fn exists(&self, _fingerprint: &Fingerprint) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn insert(&self, record: CanonicalPropertyRecord) -> Result<CanonicalPropertyRecord, StoreError> {
            self.0.insert(record).await
        }
        async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
            self.0.count_by_source().await
        }
        async fn clear(&self) -> Result<u64, StoreError> {
            self.0.clear().await
        }
    }

    #[tokio::test]
    async fn rejected_insert_after_race_counts_as_duplicate() {
        let reconciler = Reconciler::new(Arc::new(RacingStore(MemoryFingerprintStore::new())));
        let batch = reconciler
            .reconcile(
                Uuid::new_v4(),
                "Pune",
                vec![record("https://housing.com/p/5"), record("https://housing.com/p/5")],
            )
            .await;
        assert_eq!(batch.counts.created, 1);
        assert_eq!(batch.counts.duplicates, 1);
        assert_eq!(batch.counts.errors, 0);
    }
}
