//! Ingestion orchestration: per-source acquisition with retry and synthetic fallback,
//! normalization, and reconciliation into the fingerprint store.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use reag_adapters::{adapter_for_source, Acquisition, AdapterContext, AdapterError, Fetchers, SourceAdapter};
use reag_core::{CanonicalPropertyRecord, ScrapeBatchResult, SourceRunSummary};
use reag_storage::{
    with_retry, BrowserFetcher, FingerprintStore, HttpFetcher, MemoryFingerprintStore, PgFingerprintStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod enrich;
mod normalize;
mod reconcile;
pub mod rules;

pub use config::{LlmConfig, ResolvedSources, SourceConfig, SourceRegistry, SyncConfig, DEFAULT_SYNTHETIC_SEED};
pub use enrich::{
    build_request, extract_json_from_response, parse_reply, target_schema, EnrichmentError, EnrichmentReply,
    EnrichmentRequest, EnrichmentService, NumberOrText, OllamaEnrichmentService, ReplyArea, ReplyContact,
    ReplyLocation, ValidatedReply,
};
pub use normalize::{
    fallback_normalize, NormalizationPath, NormalizeContext, Normalizer, FALLBACK_CONFIDENCE, UNKNOWN_CITY,
    UNKNOWN_TITLE,
};
pub use reconcile::Reconciler;

pub const CRATE_NAME: &str = "reag-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub display_name: String,
    pub acquisition: Acquisition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub total_records: u64,
    pub records_by_source: BTreeMap<String, u64>,
    pub sources: Vec<SourceStatus>,
    /// Registry entries with no adapter; each fails its share of every run.
    pub unresolved_sources: Vec<String>,
    pub enrichment_enabled: bool,
    pub synthetic_fallback: bool,
}

struct SourceOutcome {
    records: Vec<CanonicalPropertyRecord>,
    summary: SourceRunSummary,
}

/// Handles each spawned source task owns.
#[derive(Clone)]
struct RunShared {
    config: Arc<SyncConfig>,
    fetchers: Fetchers,
    normalizer: Arc<Normalizer>,
}

pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    fetchers: Fetchers,
    normalizer: Arc<Normalizer>,
    store: Arc<dyn FingerprintStore>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    unresolved: Vec<String>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn FingerprintStore>, registry: &SourceRegistry) -> Result<Self> {
        let fetchers = Fetchers {
            http: Arc::new(HttpFetcher::new(config.http_client_config())?),
            browser: Arc::new(BrowserFetcher::new(config.browser_config())),
        };
        let normalizer = Normalizer::from_config(&config.llm)?;
        let ResolvedSources { adapters, unresolved } = registry.resolve();
        Ok(Self {
            config: Arc::new(config),
            fetchers,
            normalizer: Arc::new(normalizer),
            store,
            adapters,
            unresolved,
        })
    }

    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self.unresolved.clear();
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn shared(&self) -> RunShared {
        RunShared {
            config: self.config.clone(),
            fetchers: self.fetchers.clone(),
            normalizer: self.normalizer.clone(),
        }
    }

    /// Scrape every configured source for `city`, splitting `total_limit` across them.
    /// Per-source and per-record failures are reported in the result, never returned.
    pub async fn scrape_all(&self, city: &str, total_limit: usize) -> ScrapeBatchResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut batch = ScrapeBatchResult::new(run_id, city, started_at);
        info!(%run_id, city, total_limit, sources = self.adapters.len(), "scrape run started");

        for source_id in &self.unresolved {
            error!(%run_id, source_id, "no adapter registered for source");
            batch.record_source_failure(source_id, "no adapter registered for source");
        }

        let shares = split_limit(total_limit, self.adapters.len());
        let records = self.run_sources(run_id, city, &self.adapters, &shares, &mut batch).await;
        self.finish(records, &mut batch).await;
        batch
    }

    /// Same pipeline for a single source with the whole limit. The source may be any
    /// configured adapter or a built-in one.
    pub async fn scrape_one_source(&self, source_id: &str, city: &str, limit: usize) -> Result<ScrapeBatchResult> {
        let adapter = match self.adapters.iter().find(|a| a.source_id() == source_id) {
            Some(adapter) => adapter.clone(),
            None => match adapter_for_source(source_id) {
                Some(adapter) => Arc::from(adapter),
                None => bail!("unknown source `{source_id}`"),
            },
        };
        let run_id = Uuid::new_v4();
        let mut batch = ScrapeBatchResult::new(run_id, city, Utc::now());
        info!(%run_id, city, limit, source_id, "single-source scrape started");
        let records = self.run_sources(run_id, city, &[adapter], &[limit], &mut batch).await;
        self.finish(records, &mut batch).await;
        Ok(batch)
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let records_by_source = self.store.count_by_source().await.context("counting stored records")?;
        Ok(PipelineStatus {
            total_records: records_by_source.values().sum(),
            records_by_source,
            sources: self
                .adapters
                .iter()
                .map(|a| SourceStatus {
                    source_id: a.source_id().to_string(),
                    display_name: a.display_name().to_string(),
                    acquisition: a.acquisition(),
                })
                .collect(),
            unresolved_sources: self.unresolved.clone(),
            enrichment_enabled: self.normalizer.has_service(),
            synthetic_fallback: self.config.synthetic_fallback,
        })
    }

    /// Delete every stored record, returning how many were removed.
    pub async fn clear_all(&self) -> Result<u64> {
        let removed = self.store.clear().await.context("clearing stored records")?;
        warn!(removed, "all stored records cleared");
        Ok(removed)
    }

    /// Fan out one task per source and settle all of them.
    async fn run_sources(
        &self,
        run_id: Uuid,
        city: &str,
        adapters: &[Arc<dyn SourceAdapter>],
        shares: &[usize],
        batch: &mut ScrapeBatchResult,
    ) -> Vec<CanonicalPropertyRecord> {
        let handles: Vec<_> = adapters
            .iter()
            .zip(shares)
            .map(|(adapter, &limit)| {
                let span = info_span!("source_pipeline", %run_id, source_id = %adapter.source_id());
                let task = run_source(self.shared(), adapter.clone(), run_id, city.to_string(), limit);
                (adapter.source_id().to_string(), tokio::spawn(task.instrument(span)))
            })
            .collect();

        let (ids, tasks): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let mut records = Vec::new();
        for (source_id, joined) in ids.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(Ok(outcome)) => {
                    records.extend(outcome.records);
                    batch.sources.push(outcome.summary);
                }
                Ok(Err(err)) => {
                    error!(%run_id, source_id, error = %err, "source pipeline failed");
                    batch.record_source_failure(&source_id, err.to_string());
                }
                Err(join_err) => {
                    error!(%run_id, source_id, error = %join_err, "source task aborted");
                    batch.record_source_failure(&source_id, format!("source task aborted: {join_err}"));
                }
            }
        }
        records
    }

    async fn finish(&self, records: Vec<CanonicalPropertyRecord>, batch: &mut ScrapeBatchResult) {
        Reconciler::new(self.store.clone()).reconcile_into(records, batch).await;
        batch.finished_at = Utc::now();
        info!(
            run_id = %batch.run_id,
            scraped = batch.counts.scraped,
            created = batch.counts.created,
            duplicates = batch.counts.duplicates,
            errors = batch.counts.errors,
            failed_sources = batch.counts.failed_sources,
            "scrape run finished"
        );
    }
}

/// Even split; the first `total % n` sources take one extra.
pub fn split_limit(total: usize, sources: usize) -> Vec<usize> {
    if sources == 0 {
        return Vec::new();
    }
    let base = total / sources;
    let extra = total % sources;
    (0..sources).map(|i| base + usize::from(i < extra)).collect()
}

/// acquire (with retry) -> extract -> synthetic fallback -> normalize, for one source.
async fn run_source(
    shared: RunShared,
    adapter: Arc<dyn SourceAdapter>,
    run_id: Uuid,
    city: String,
    limit: usize,
) -> Result<SourceOutcome, AdapterError> {
    let source_id = adapter.source_id().to_string();
    let mut summary = SourceRunSummary {
        source_id: source_id.clone(),
        ..Default::default()
    };
    let ctx = AdapterContext {
        run_id,
        fetched_at: Utc::now(),
    };
    if limit == 0 {
        return Ok(SourceOutcome {
            records: Vec::new(),
            summary,
        });
    }

    let policy = shared.config.retry_policy();
    let fetched = {
        let adapter: &dyn SourceAdapter = adapter.as_ref();
        let (fetchers, ctx, city) = (&shared.fetchers, &ctx, city.as_str());
        with_retry(&policy, &source_id, move |attempt| {
            debug!(attempt, "acquiring listing page");
            adapter.fetch_listing(fetchers, ctx, city)
        })
        .await
    };

    let (mut candidates, page_url) = match fetched {
        Ok(doc) => {
            let candidates = adapter.parse_listing(&doc, limit);
            info!(candidates = candidates.len(), truncated = doc.truncated, "extraction finished");
            (candidates, doc.url)
        }
        Err(err) if shared.config.synthetic_fallback => {
            warn!(error = %err, "acquisition failed; falling back to synthetic listings");
            let page_url = adapter
                .listing_targets(&city)
                .first()
                .map(|t| t.url.clone())
                .unwrap_or_default();
            (Vec::new(), page_url)
        }
        Err(err) => return Err(err),
    };

    if candidates.is_empty() && shared.config.synthetic_fallback {
        warn!(limit, "no candidates extracted; generating synthetic listings");
        candidates = adapter.synthesize(&city, limit, shared.config.synthetic_seed);
        summary.synthetic_fill = true;
    }
    summary.candidates = candidates.len();

    let norm_ctx = NormalizeContext {
        source_name: source_id.clone(),
        city: city.clone(),
        page_url,
        scraped_at: ctx.fetched_at,
    };
    let mut records = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let (record, path) = shared.normalizer.normalize_or_fallback(candidate, &norm_ctx).await;
        match path {
            NormalizationPath::Ai => summary.ai_normalized += 1,
            NormalizationPath::Fallback => summary.fallback_normalized += 1,
        }
        records.push(record);
    }
    debug!(
        ai = summary.ai_normalized,
        fallback = summary.fallback_normalized,
        "normalization finished"
    );
    Ok(SourceOutcome { records, summary })
}

/// Postgres when `DATABASE_URL` is set (migrations applied), in-memory otherwise.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn FingerprintStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgFingerprintStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryFingerprintStore::new()))
        }
    }
}

pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let store = open_store(&config).await?;
    SyncPipeline::new(config, store, &registry)
}

pub async fn run_scrape_from_env(city: &str, limit: usize) -> Result<ScrapeBatchResult> {
    let pipeline = pipeline_from_env().await?;
    Ok(pipeline.scrape_all(city, limit).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_split_is_even_and_sums_to_total() {
        assert_eq!(split_limit(9, 3), vec![3, 3, 3]);
        assert_eq!(split_limit(10, 3), vec![4, 3, 3]);
        assert_eq!(split_limit(2, 3), vec![1, 1, 0]);
        assert!(split_limit(5, 0).is_empty());
    }
}
