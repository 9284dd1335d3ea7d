//! Core domain model for REAG listings: scraped candidates, canonical records and batch reports.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reag-core";

pub const TAG_SYNTHETIC: &str = "synthetic";
pub const TAG_AI_NORMALIZED: &str = "ai-normalized";
pub const TAG_FALLBACK_NORMALIZED: &str = "fallback-normalized";

/// Longest title a canonical record may carry.
pub const MAX_TITLE_CHARS: usize = 300;
/// Largest plausible bedroom count.
pub const MAX_BHK: u32 = 50;

/// Unnormalized listing as recovered from a source page (or manufactured by the
/// synthetic generator). Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawCandidateRecord {
    pub title: String,
    pub price_text: String,
    pub location_text: String,
    pub description_text: Option<String>,
    pub images: Vec<String>,
    pub source_link: Option<String>,
    /// Demo-quality fill rather than a real listing.
    pub synthetic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    #[default]
    Sale,
    Rent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Apartment,
    House,
    Villa,
    Plot,
    Commercial,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AreaUnit {
    #[default]
    Sqft,
    Sqm,
    Acres,
    Sqyd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    #[default]
    Active,
    Sold,
    Rented,
    Inactive,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub city: String,
    pub area: Option<String>,
    pub full_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AreaMeasure {
    pub size: f64,
    pub unit: AreaUnit,
}

/// Provenance of a canonical record. Always set by the pipeline, never by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub name: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub agent: Option<String>,
}

/// Natural key of a listing: `(source.name, source.url)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source_name: String,
    pub source_url: String,
}

impl Fingerprint {
    pub fn new(source_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            source_url: source_url.into(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.source_name, self.source_url)
    }
}

/// The persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalPropertyRecord {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Smallest currency unit (whole rupees).
    pub price: i64,
    pub price_type: PriceType,
    pub location: Location,
    pub property_type: PropertyType,
    pub bhk: Option<u32>,
    pub area: AreaMeasure,
    pub amenities: BTreeSet<String>,
    pub images: Vec<String>,
    pub source: SourceRef,
    pub contact: Contact,
    pub status: ListingStatus,
    pub ai_processed: bool,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid absolute URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("field `{field}` out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
}

impl CanonicalPropertyRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.source.name.clone(), self.source.url.clone())
    }

    /// Check the record against the canonical schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(ValidationError::MissingField("title"));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ValidationError::OutOfRange {
                field: "title",
                detail: format!("longer than {MAX_TITLE_CHARS} characters"),
            });
        }
        if self.location.city.trim().is_empty() {
            return Err(ValidationError::MissingField("location.city"));
        }
        if self.source.name.trim().is_empty() {
            return Err(ValidationError::MissingField("source.name"));
        }
        if !is_http_url(&self.source.url) {
            return Err(ValidationError::InvalidUrl {
                field: "source.url",
                value: self.source.url.clone(),
            });
        }
        if self.price < 0 {
            return Err(ValidationError::OutOfRange {
                field: "price",
                detail: format!("{} is negative", self.price),
            });
        }
        if !(self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)) {
            return Err(ValidationError::OutOfRange {
                field: "confidence",
                detail: format!("{} not in [0, 1]", self.confidence),
            });
        }
        if !(self.area.size.is_finite() && self.area.size >= 0.0) {
            return Err(ValidationError::OutOfRange {
                field: "area.size",
                detail: format!("{} is not a non-negative number", self.area.size),
            });
        }
        if let Some(bhk) = self.bhk {
            if bhk > MAX_BHK {
                return Err(ValidationError::OutOfRange {
                    field: "bhk",
                    detail: format!("{bhk} exceeds {MAX_BHK}"),
                });
            }
        }
        if let Some(bad) = self.images.iter().find(|img| !is_http_url(img)) {
            return Err(ValidationError::InvalidUrl {
                field: "images",
                value: bad.clone(),
            });
        }
        Ok(())
    }

    pub fn projection(&self) -> CreatedListing {
        CreatedListing {
            id: self.id,
            title: self.title.clone(),
            price: self.price,
            city: self.location.city.clone(),
            source_name: self.source.name.clone(),
            source_url: self.source.url.clone(),
        }
    }
}

/// Absolute `http(s)` URL with a host.
pub fn is_http_url(value: &str) -> bool {
    Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

/// Lower-cased alphanumeric runs joined by `-` ("New  Delhi" -> "new-delhi").
pub fn slugify(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Minimal projection of a record created during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedListing {
    pub id: Uuid,
    pub title: String,
    pub price: i64,
    pub city: String,
    pub source_name: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchErrorKind {
    Source,
    Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub kind: BatchErrorKind,
    /// Source id for source failures, fingerprint for record failures.
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchCounts {
    pub scraped: usize,
    pub created: usize,
    pub duplicates: usize,
    /// Record-level errors only; failed sources are counted separately.
    pub errors: usize,
    pub failed_sources: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub candidates: usize,
    pub synthetic_fill: bool,
    pub ai_normalized: usize,
    pub fallback_normalized: usize,
}

/// Outcome of one orchestrator run. Returned to the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeBatchResult {
    pub run_id: Uuid,
    pub city: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: BatchCounts,
    pub created: Vec<CreatedListing>,
    pub errors: Vec<BatchError>,
    pub sources: Vec<SourceRunSummary>,
}

impl ScrapeBatchResult {
    pub fn new(run_id: Uuid, city: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            city: city.into(),
            started_at,
            finished_at: started_at,
            counts: BatchCounts::default(),
            created: Vec::new(),
            errors: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn record_created(&mut self, record: &CanonicalPropertyRecord) {
        self.counts.scraped += 1;
        self.counts.created += 1;
        self.created.push(record.projection());
    }

    pub fn record_duplicate(&mut self) {
        self.counts.scraped += 1;
        self.counts.duplicates += 1;
    }

    pub fn record_error(&mut self, fingerprint: &Fingerprint, reason: impl Into<String>) {
        self.counts.scraped += 1;
        self.counts.errors += 1;
        self.errors.push(BatchError {
            kind: BatchErrorKind::Record,
            subject: fingerprint.to_string(),
            reason: reason.into(),
        });
    }

    pub fn record_source_failure(&mut self, source_id: &str, reason: impl Into<String>) {
        self.counts.failed_sources += 1;
        self.errors.push(BatchError {
            kind: BatchErrorKind::Source,
            subject: source_id.to_string(),
            reason: reason.into(),
        });
    }
}
