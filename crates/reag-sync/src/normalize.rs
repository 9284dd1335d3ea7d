use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reag_core::{
    is_http_url, slugify, CanonicalPropertyRecord, Contact, ListingStatus, RawCandidateRecord, SourceRef,
    MAX_BHK, MAX_TITLE_CHARS, TAG_AI_NORMALIZED, TAG_FALLBACK_NORMALIZED, TAG_SYNTHETIC,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::enrich::{build_request, parse_reply, EnrichmentError, EnrichmentService, OllamaEnrichmentService, ValidatedReply};
use crate::rules;

pub const FALLBACK_CONFIDENCE: f64 = 0.3;
pub const UNKNOWN_TITLE: &str = "Untitled listing";
pub const UNKNOWN_CITY: &str = "Unknown";

const ANCHOR_DIGEST_CHARS: usize = 12;

/// Provenance the pipeline owns for every record it normalizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeContext {
    pub source_name: String,
    pub city: String,
    /// Page the candidate came from; anchors a source URL when the candidate has no link.
    pub page_url: String,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationPath {
    Ai,
    Fallback,
}

pub struct Normalizer {
    service: Option<Arc<dyn EnrichmentService>>,
    max_input_chars: usize,
}

impl Normalizer {
    pub fn new(service: Arc<dyn EnrichmentService>, max_input_chars: usize) -> Self {
        Self {
            service: Some(service),
            max_input_chars,
        }
    }

    /// Normalizer that always takes the deterministic path.
    pub fn deterministic() -> Self {
        Self {
            service: None,
            max_input_chars: 0,
        }
    }

    pub fn from_config(llm: &LlmConfig) -> anyhow::Result<Self> {
        if !llm.enabled {
            return Ok(Self::deterministic());
        }
        let service = OllamaEnrichmentService::new(llm.clone())?;
        Ok(Self::new(Arc::new(service), llm.max_input_chars))
    }

    pub fn has_service(&self) -> bool {
        self.service.is_some()
    }

    /// Enrich through the external service. Any service or reply failure is an
    /// [`EnrichmentError`]; it is never retried.
    pub async fn normalize(
        &self,
        candidate: &RawCandidateRecord,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalPropertyRecord, EnrichmentError> {
        let service = self.service.as_ref().ok_or(EnrichmentError::Disabled)?;
        let request = build_request(candidate, &ctx.city, self.max_input_chars);
        let raw = service.complete(&request).await?;
        let reply = parse_reply(&raw)?;
        Ok(merge_reply(candidate, ctx, reply))
    }

    /// Synthetic candidates skip enrichment; everything else falls back on failure.
    pub async fn normalize_or_fallback(
        &self,
        candidate: &RawCandidateRecord,
        ctx: &NormalizeContext,
    ) -> (CanonicalPropertyRecord, NormalizationPath) {
        if candidate.synthetic {
            return (fallback_normalize(candidate, ctx), NormalizationPath::Fallback);
        }
        match self.normalize(candidate, ctx).await {
            Ok(record) => (record, NormalizationPath::Ai),
            Err(EnrichmentError::Disabled) => (fallback_normalize(candidate, ctx), NormalizationPath::Fallback),
            Err(err) => {
                warn!(source = %ctx.source_name, title = %candidate.title, error = %err, "enrichment failed; using fallback normalizer");
                (fallback_normalize(candidate, ctx), NormalizationPath::Fallback)
            }
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn anchor_slug(title: &str) -> String {
    match slugify(title) {
        s if s.is_empty() => "untitled".to_string(),
        s => truncate_chars(&s, 80),
    }
}

/// Short digest of the listing's visible content, so linkless listings that share a
/// title on one page still get distinct anchors.
fn content_digest(candidate: &RawCandidateRecord) -> String {
    let mut hasher = Sha256::new();
    for part in [&candidate.title, &candidate.price_text, &candidate.location_text] {
        let folded = part.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        hasher.update(folded.as_bytes());
        hasher.update([0x1f]);
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(ANCHOR_DIGEST_CHARS);
    digest
}

/// The candidate's own link when usable, else a stable anchor on the page it came from.
fn source_url(candidate: &RawCandidateRecord, ctx: &NormalizeContext) -> String {
    if let Some(link) = candidate.source_link.as_deref().filter(|l| is_http_url(l)) {
        return link.to_string();
    }
    let page = ctx.page_url.split('#').next().unwrap_or_default();
    format!(
        "{page}#listing-{}-{}",
        anchor_slug(&candidate.title),
        content_digest(candidate)
    )
}

fn record_tags(ctx: &NormalizeContext, city: &str, path: NormalizationPath, synthetic: bool) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    tags.insert(ctx.source_name.clone());
    tags.insert(city.to_lowercase());
    tags.insert(
        match path {
            NormalizationPath::Ai => TAG_AI_NORMALIZED,
            NormalizationPath::Fallback => TAG_FALLBACK_NORMALIZED,
        }
        .to_string(),
    );
    if synthetic {
        tags.insert(TAG_SYNTHETIC.to_string());
    }
    tags
}

/// Rule-only normalization. Never fails: unparseable fields get explicit defaults.
pub fn fallback_normalize(candidate: &RawCandidateRecord, ctx: &NormalizeContext) -> CanonicalPropertyRecord {
    let title = match candidate.title.trim() {
        "" => UNKNOWN_TITLE.to_string(),
        t => truncate_chars(t, MAX_TITLE_CHARS),
    };
    let description = candidate.description_text.clone().unwrap_or_default();
    let city = match ctx.city.trim() {
        "" => UNKNOWN_CITY,
        c => c,
    };
    let body = format!("{title} {description}");

    let property_type = match rules::classify_property_type(&title) {
        reag_core::PropertyType::Other => rules::classify_property_type(&description),
        found => found,
    };
    let images = rules::dedup_exact(candidate.images.iter().filter(|i| is_http_url(i)).cloned().collect());

    CanonicalPropertyRecord {
        id: Uuid::new_v4(),
        price: rules::parse_price(&candidate.price_text).unwrap_or(0),
        price_type: rules::classify_price_type(&format!("{} {title}", candidate.price_text)),
        location: rules::split_location(&candidate.location_text, city),
        property_type,
        bhk: rules::extract_bhk(&title)
            .or_else(|| rules::extract_bhk(&description))
            .filter(|b| *b <= MAX_BHK),
        area: rules::parse_area(&body).unwrap_or_default(),
        amenities: rules::extract_amenities(&body),
        images,
        source: SourceRef {
            name: ctx.source_name.clone(),
            url: source_url(candidate, ctx),
            scraped_at: ctx.scraped_at,
        },
        contact: Contact::default(),
        status: ListingStatus::Active,
        ai_processed: false,
        confidence: FALLBACK_CONFIDENCE,
        tags: record_tags(ctx, city, NormalizationPath::Fallback, candidate.synthetic),
        title,
        description,
    }
}

/// Reply fields win over rule-derived ones; `source` always comes from `ctx`.
fn merge_reply(candidate: &RawCandidateRecord, ctx: &NormalizeContext, reply: ValidatedReply) -> CanonicalPropertyRecord {
    let base = fallback_normalize(candidate, ctx);
    let city = reply.city.unwrap_or(base.location.city);
    debug!(source = %ctx.source_name, confidence = reply.confidence, "merged enrichment reply");
    CanonicalPropertyRecord {
        id: base.id,
        title: reply
            .title
            .map(|t| truncate_chars(&t, MAX_TITLE_CHARS))
            .unwrap_or(base.title),
        description: reply.description.unwrap_or(base.description),
        price: reply.price.unwrap_or(base.price),
        price_type: reply.price_type.unwrap_or(base.price_type),
        location: reag_core::Location {
            area: reply.area_name.or(base.location.area),
            full_address: reply.full_address.or(base.location.full_address),
            city: city.clone(),
        },
        property_type: reply.property_type.unwrap_or(base.property_type),
        bhk: reply.bhk.or(base.bhk),
        area: reply.area.unwrap_or(base.area),
        amenities: reply.amenities.unwrap_or(base.amenities),
        images: base.images,
        source: base.source,
        contact: reply.contact,
        status: ListingStatus::Active,
        ai_processed: true,
        confidence: reply.confidence,
        tags: record_tags(ctx, &city, NormalizationPath::Ai, candidate.synthetic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use reag_core::{AreaUnit, PriceType, PropertyType};

    struct Canned(Result<&'static str, ()>);

    #[async_trait]
    impl EnrichmentService for Canned {
        async fn complete(&self, _request: &crate::enrich::EnrichmentRequest) -> Result<String, EnrichmentError> {
            self.0
                .map(ToString::to_string)
                .map_err(|_| EnrichmentError::Connection("refused".into()))
        }
    }

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            source_name: "magicbricks".into(),
            city: "Mumbai".into(),
            page_url: "https://www.magicbricks.com/flats-in-mumbai#top".into(),
            scraped_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        }
    }

    fn candidate() -> RawCandidateRecord {
        RawCandidateRecord {
            title: "2 BHK Flat for Sale in Powai".into(),
            price_text: "₹1.2 Cr".into(),
            location_text: "Hiranandani Gardens, Powai, Mumbai".into(),
            description_text: Some("950 sqft, gym and covered parking".into()),
            images: vec![
                "https://img.example/a.jpg".into(),
                "https://img.example/a.jpg".into(),
                "not a url".into(),
            ],
            source_link: Some("https://www.magicbricks.com/propertyDetails/1".into()),
            synthetic: false,
        }
    }

    #[test]
    fn fallback_applies_rules_and_low_confidence() {
        let record = fallback_normalize(&candidate(), &ctx());
        assert_eq!(record.price, 12_000_000);
        assert_eq!(record.price_type, PriceType::Sale);
        assert_eq!(record.bhk, Some(2));
        assert_eq!(record.property_type, PropertyType::Apartment);
        assert_eq!(record.area.size, 950.0);
        assert_eq!(record.area.unit, AreaUnit::Sqft);
        assert!(record.amenities.contains("Gym") && record.amenities.contains("Parking"));
        assert_eq!(record.images, vec!["https://img.example/a.jpg".to_string()]);
        assert_eq!(record.location.area.as_deref(), Some("Hiranandani Gardens"));
        assert!(!record.ai_processed);
        assert_eq!(record.confidence, FALLBACK_CONFIDENCE);
        assert!(record.tags.contains(TAG_FALLBACK_NORMALIZED));
        assert!(record.tags.contains("mumbai"));
        assert_eq!(record.validate(), Ok(()));
    }

    #[test]
    fn fallback_on_empty_candidate_is_still_valid() {
        let record = fallback_normalize(&RawCandidateRecord::default(), &ctx());
        assert_eq!(record.title, UNKNOWN_TITLE);
        assert_eq!(record.price, 0);
        assert_eq!(record.bhk, None);
        assert!(record
            .source
            .url
            .starts_with("https://www.magicbricks.com/flats-in-mumbai#listing-untitled-"));
        assert_eq!(record.validate(), Ok(()));
    }

    #[test]
    fn linkless_listings_sharing_a_title_get_distinct_anchors() {
        let linkless = |price: &str, location: &str| RawCandidateRecord {
            title: "2 BHK Apartment".into(),
            price_text: price.into(),
            location_text: location.into(),
            ..Default::default()
        };
        let baner = fallback_normalize(&linkless("₹50 Lakh", "Baner, Pune"), &ctx());
        let kothrud = fallback_normalize(&linkless("₹90 Lakh", "Kothrud, Pune"), &ctx());
        let baner_again = fallback_normalize(&linkless("₹50  Lakh", "baner, Pune"), &ctx());

        assert_ne!(baner.source.url, kothrud.source.url);
        assert_eq!(baner.source.url, baner_again.source.url);
        assert!(baner
            .source
            .url
            .starts_with("https://www.magicbricks.com/flats-in-mumbai#listing-2-bhk-apartment-"));
        assert_eq!(baner.validate(), Ok(()));
    }

    #[tokio::test]
    async fn reply_fields_win_but_source_stays_ours() {
        let normalizer = Normalizer::new(
            Arc::new(Canned(Ok(
                r#"{"title":"Spacious 2BHK, Powai","price":11500000,"priceType":"sale",
                    "location":{"city":"Mumbai","area":"Powai"},"propertyType":"apartment",
                    "bhk":2,"confidence":0.9,
                    "source":{"name":"other","url":"https://elsewhere.example/x"}}"#,
            ))),
            1000,
        );
        let (record, path) = normalizer.normalize_or_fallback(&candidate(), &ctx()).await;
        assert_eq!(path, NormalizationPath::Ai);
        assert_eq!(record.title, "Spacious 2BHK, Powai");
        assert_eq!(record.price, 11_500_000);
        assert_eq!(record.location.area.as_deref(), Some("Powai"));
        assert_eq!(record.source.name, "magicbricks");
        assert_eq!(record.source.url, "https://www.magicbricks.com/propertyDetails/1");
        assert_eq!(record.source.scraped_at, ctx().scraped_at);
        assert!(record.ai_processed);
        assert_eq!(record.confidence, 0.9);
        assert!(record.tags.contains(TAG_AI_NORMALIZED));
        // absent in the reply, taken from the candidate
        assert!(record.amenities.contains("Gym"));
    }

    #[tokio::test]
    async fn confidence_ordering_between_paths() {
        let ai = Normalizer::new(Arc::new(Canned(Ok(r#"{"title":"x","confidence":0.2}"#))), 1000);
        let (record, _) = ai.normalize_or_fallback(&candidate(), &ctx()).await;
        assert_eq!(record.confidence, 0.2);

        let failing = Normalizer::new(Arc::new(Canned(Err(()))), 1000);
        let (record, path) = failing.normalize_or_fallback(&candidate(), &ctx()).await;
        assert_eq!(path, NormalizationPath::Fallback);
        assert!(record.confidence <= FALLBACK_CONFIDENCE);
    }

    #[tokio::test]
    async fn malformed_reply_routes_to_fallback() {
        let normalizer = Normalizer::new(Arc::new(Canned(Ok("I cannot help with that."))), 1000);
        assert!(matches!(
            normalizer.normalize(&candidate(), &ctx()).await,
            Err(EnrichmentError::Malformed(_))
        ));
        let (record, path) = normalizer.normalize_or_fallback(&candidate(), &ctx()).await;
        assert_eq!(path, NormalizationPath::Fallback);
        assert_eq!(record.price, 12_000_000);
    }

    #[tokio::test]
    async fn synthetic_candidates_skip_enrichment() {
        let normalizer = Normalizer::new(Arc::new(Canned(Ok(r#"{"title":"x","confidence":0.95}"#))), 1000);
        let mut synthetic = candidate();
        synthetic.synthetic = true;
        let (record, path) = normalizer.normalize_or_fallback(&synthetic, &ctx()).await;
        assert_eq!(path, NormalizationPath::Fallback);
        assert!(record.tags.contains(TAG_SYNTHETIC));
        assert_eq!(record.confidence, FALLBACK_CONFIDENCE);
    }
}
