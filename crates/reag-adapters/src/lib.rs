//! Source adapter contracts + built-in listing-site adapters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reag_core::{slugify, RawCandidateRecord};
use reag_storage::{BrowserFetcher, FetchError, HttpFetcher, RetryDisposition, Retryable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

mod extract;
mod synthetic;

pub use extract::{extract_listings, ExtractionPlan, ExtractionStrategy};
pub use synthetic::{generate_synthetic, PriceBand, SyntheticProfile};

pub const CRATE_NAME: &str = "reag-adapters";

pub const BUILTIN_SOURCES: &[&str] = &["magicbricks", "99acres", "housing"];

/// How a source's listing page is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acquisition {
    /// Plain GET, body read incrementally up to a cap or `</body>`.
    Streaming,
    /// Headless browser render for client-side rendered pages.
    Rendered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDocument {
    pub source_id: String,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub acquisition: Acquisition,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("adapter misconfigured: {0}")]
    Config(String),
}

impl Retryable for AdapterError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            AdapterError::Fetch(err) => err.disposition(),
            AdapterError::Config(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Both acquisition strategies, shared across every adapter in a run.
#[derive(Debug, Clone)]
pub struct Fetchers {
    pub http: Arc<HttpFetcher>,
    pub browser: Arc<BrowserFetcher>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn acquisition(&self) -> Acquisition;

    /// Candidate listing URLs for `city`, in the order they should be tried.
    fn listing_targets(&self, city: &str) -> Vec<ListingTarget>;

    /// One acquisition attempt: the first candidate URL that fetches wins.
    async fn fetch_listing(
        &self,
        fetchers: &Fetchers,
        ctx: &AdapterContext,
        city: &str,
    ) -> Result<RawDocument, AdapterError>;

    /// Never fails; an empty result routes the source to [`SourceAdapter::synthesize`].
    fn parse_listing(&self, doc: &RawDocument, limit: usize) -> Vec<RawCandidateRecord>;

    fn synthesize(&self, city: &str, limit: usize, seed: u64) -> Vec<RawCandidateRecord>;
}

/// Everything that distinguishes one listing site from another.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteProfile {
    pub source_id: String,
    pub display_name: String,
    pub acquisition: Acquisition,
    /// URL templates with a `{city}` placeholder.
    pub listing_urls: Vec<String>,
    pub base_url: String,
    pub plan: ExtractionPlan,
    pub price_band: PriceBand,
}

#[derive(Debug, Clone)]
pub struct ListingSiteAdapter {
    profile: SiteProfile,
}

impl ListingSiteAdapter {
    pub fn new(profile: SiteProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }
}

#[async_trait]
impl SourceAdapter for ListingSiteAdapter {
    fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    fn display_name(&self) -> &str {
        &self.profile.display_name
    }

    fn acquisition(&self) -> Acquisition {
        self.profile.acquisition
    }

    fn listing_targets(&self, city: &str) -> Vec<ListingTarget> {
        let slug = city_slug(city);
        self.profile
            .listing_urls
            .iter()
            .map(|template| ListingTarget {
                url: template.replace("{city}", &slug),
            })
            .collect()
    }

    async fn fetch_listing(
        &self,
        fetchers: &Fetchers,
        ctx: &AdapterContext,
        city: &str,
    ) -> Result<RawDocument, AdapterError> {
        let source_id = self.source_id();
        let mut last_err = None;
        for target in self.listing_targets(city) {
            let fetched = match self.profile.acquisition {
                Acquisition::Streaming => fetchers.http.fetch_partial(ctx.run_id, source_id, &target.url).await,
                Acquisition::Rendered => fetchers.browser.render(ctx.run_id, source_id, &target.url).await,
            };
            match fetched {
                Ok(doc) => {
                    debug!(source_id, url = %doc.final_url, bytes = doc.body.len(), "listing page acquired");
                    return Ok(RawDocument {
                        source_id: source_id.to_string(),
                        url: doc.final_url,
                        body: doc.body,
                        fetched_at: ctx.fetched_at,
                        acquisition: self.profile.acquisition,
                        truncated: doc.truncated,
                    });
                }
                Err(err @ FetchError::RenderingUnavailable { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!(source_id, url = %target.url, error = %err, "candidate url failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| FetchError::NoCandidateUrl {
                source_id: source_id.to_string(),
            })
            .into())
    }

    fn parse_listing(&self, doc: &RawDocument, limit: usize) -> Vec<RawCandidateRecord> {
        extract_listings(&doc.body, &doc.url, &self.profile.plan, limit)
    }

    fn synthesize(&self, city: &str, limit: usize, seed: u64) -> Vec<RawCandidateRecord> {
        let profile = SyntheticProfile {
            source_id: self.profile.source_id.clone(),
            display_name: self.profile.display_name.clone(),
            base_url: self.profile.base_url.clone(),
            price_band: self.profile.price_band,
        };
        generate_synthetic(&profile, city, limit, seed)
    }
}

/// Built-in profile for a known listing site.
pub fn site_profile(source_id: &str) -> Option<SiteProfile> {
    use ExtractionStrategy::*;
    match source_id {
        "magicbricks" => Some(SiteProfile {
            source_id: "magicbricks".into(),
            display_name: "MagicBricks".into(),
            acquisition: Acquisition::Streaming,
            listing_urls: vec![
                "https://www.magicbricks.com/property-for-sale-rent-in-{city}/residential-real-estate-{city}".into(),
                "https://www.magicbricks.com/flats-in-{city}-for-sale-pppfs".into(),
            ],
            base_url: "https://www.magicbricks.com".into(),
            plan: ExtractionPlan::site_specific(ExtractionPlan {
                containers: vec![".mb-srp__card", ".mb-srp__list > div"],
                title: vec![Text(".mb-srp__card--title")],
                price: vec![Text(".mb-srp__card__price--amount")],
                location: vec![Text(".mb-srp__card__society--name"), Text(".mb-srp__card__locality")],
                description: vec![Text(".mb-srp__card--desc--text")],
                image: vec![Attr {
                    selector: ".mb-srp__card__photo img",
                    attr: "src",
                }],
                link: vec![Attr {
                    selector: "a.mb-srp__card__title--link",
                    attr: "href",
                }],
            }),
            price_band: PriceBand {
                min_lakh: 40.0,
                max_lakh: 350.0,
            },
        }),
        "99acres" => Some(SiteProfile {
            source_id: "99acres".into(),
            display_name: "99acres".into(),
            acquisition: Acquisition::Rendered,
            listing_urls: vec![
                "https://www.99acres.com/property-in-{city}-ffid".into(),
                "https://www.99acres.com/search/property/buy/{city}".into(),
            ],
            base_url: "https://www.99acres.com".into(),
            plan: ExtractionPlan::site_specific(ExtractionPlan {
                containers: vec![".tupleNew__tupleWrap", "[class*='srpTuple__tupleDetails']"],
                title: vec![Text(".tupleNew__propType"), Text(".srpTuple__propertyHeading")],
                price: vec![Text(".tupleNew__priceValWrap"), Text(".srpTuple__priceVal")],
                location: vec![Text(".tupleNew__locationName"), Text(".srpTuple__locationName")],
                description: vec![Text(".tupleNew__descText")],
                image: vec![Attr {
                    selector: ".tupleNew__imgWrap img",
                    attr: "src",
                }],
                link: vec![Attr {
                    selector: "a.tupleNew__propertyHeading",
                    attr: "href",
                }],
            }),
            price_band: PriceBand {
                min_lakh: 35.0,
                max_lakh: 500.0,
            },
        }),
        "housing" => Some(SiteProfile {
            source_id: "housing".into(),
            display_name: "Housing.com".into(),
            acquisition: Acquisition::Rendered,
            listing_urls: vec![
                "https://housing.com/in/buy/{city}/{city}".into(),
                "https://housing.com/in/buy/searches/{city}".into(),
            ],
            base_url: "https://housing.com".into(),
            plan: ExtractionPlan::site_specific(ExtractionPlan {
                containers: vec!["[data-testid='card-container']", "article[data-testid*='card']"],
                title: vec![Text("[data-q='title']"), Text("h2")],
                price: vec![Text("[data-q='price']")],
                location: vec![Text("[data-q='address']"), Text("[data-q='locality']")],
                description: vec![Text("[data-q='desc']")],
                image: vec![Attr {
                    selector: "img[data-q='photo']",
                    attr: "src",
                }],
                link: vec![Attr {
                    selector: "a[data-q='card-link']",
                    attr: "href",
                }],
            }),
            price_band: PriceBand {
                min_lakh: 30.0,
                max_lakh: 400.0,
            },
        }),
        _ => None,
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    site_profile(source_id).map(|profile| Box::new(ListingSiteAdapter::new(profile)) as Box<dyn SourceAdapter>)
}

/// Lowercase, dash-separated form of a city name as used in listing URLs.
pub fn city_slug(input: &str) -> String {
    slugify(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reag_storage::{BrowserConfig, HttpClientConfig};

    fn fetchers() -> Fetchers {
        Fetchers {
            http: Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            browser: Arc::new(BrowserFetcher::new(BrowserConfig::default())),
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn builtin_sources_resolve_and_unknown_does_not() {
        for id in BUILTIN_SOURCES {
            let adapter = adapter_for_source(id).expect("builtin adapter");
            assert_eq!(adapter.source_id(), *id);
            assert!(!adapter.listing_targets("Mumbai").is_empty());
        }
        assert!(adapter_for_source("nobroker").is_none());
    }

    #[test]
    fn listing_targets_substitute_city_slug_in_order() {
        let adapter = adapter_for_source("housing").unwrap();
        let urls: Vec<_> = adapter.listing_targets("Navi Mumbai").into_iter().map(|t| t.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://housing.com/in/buy/navi-mumbai/navi-mumbai".to_string(),
                "https://housing.com/in/buy/searches/navi-mumbai".to_string(),
            ]
        );
    }

    #[test]
    fn city_slug_collapses_separators() {
        assert_eq!(city_slug("  New   Delhi "), "new-delhi");
        assert_eq!(city_slug("Bengaluru/Bangalore"), "bengaluru-bangalore");
    }

    #[test]
    fn adapter_errors_inherit_fetch_disposition() {
        let err = AdapterError::from(FetchError::Timeout {
            url: "https://x.example".into(),
            after: std::time::Duration::from_secs(1),
        });
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(
            AdapterError::Config("bad".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[cfg(not(feature = "browser"))]
    #[tokio::test]
    async fn rendered_source_without_browser_fails_fast() {
        let adapter = adapter_for_source("99acres").unwrap();
        let err = adapter.fetch_listing(&fetchers(), &ctx(), "Pune").await.unwrap_err();
        assert!(matches!(err, AdapterError::Fetch(FetchError::RenderingUnavailable { .. })));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn profile_without_urls_reports_no_candidate() {
        let mut profile = site_profile("magicbricks").unwrap();
        profile.listing_urls.clear();
        let adapter = ListingSiteAdapter::new(profile);
        let err = adapter.fetch_listing(&fetchers(), &ctx(), "Pune").await.unwrap_err();
        assert!(matches!(err, AdapterError::Fetch(FetchError::NoCandidateUrl { .. })));
    }

    #[test]
    fn synthesize_uses_profile_base_url() {
        let adapter = adapter_for_source("magicbricks").unwrap();
        let out = adapter.synthesize("Mumbai", 2, 9);
        assert_eq!(out.len(), 2);
        assert!(out[0]
            .source_link
            .as_deref()
            .unwrap()
            .starts_with("https://www.magicbricks.com/demo-listing/mumbai/"));
    }
}
