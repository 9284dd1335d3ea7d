//! Cascading field extraction over listing pages.
//!
//! Every logical field has an ordered list of [`ExtractionStrategy`] values, most
//! site-specific first. The first strategy that yields content wins; later strategies
//! are never merged in. Listing elements are located the same way, with a heuristic
//! block scan as the last resort.

use std::sync::LazyLock;

use reag_core::RawCandidateRecord;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

const MAX_TITLE_CHARS: usize = 200;
const HEURISTIC_MIN_CHARS: usize = 40;
const HEURISTIC_MAX_CHARS: usize = 800;
const HEURISTIC_BLOCKS: &str = "article, section, li, div, tr";

static PRICE_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:₹|\brs\.?|\binr)\s*[\d][\d,]*(?:\.\d+)?\s*(?:crores?|cr|lakhs?|lacs?|lac|l|k|thousand)?\b|\b[\d][\d,]*(?:\.\d+)?\s*(?:crores?|cr|lakhs?|lacs?|lac)\b",
    )
    .expect("price pattern should compile")
});

static LISTING_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:\d+\s*bhk|bedrooms?|for sale|for rent|sale|rent|sq\.?\s*ft|sqft|apartment|flat|villa|plot)\b")
        .expect("listing cue pattern should compile")
});

/// One way of pulling a value out of a listing element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Trimmed text of the first element matching the selector.
    Text(&'static str),
    /// Attribute of elements matching the selector.
    Attr {
        selector: &'static str,
        attr: &'static str,
    },
    /// First price-looking run in the element's own text.
    PriceInText,
    /// First non-empty text segment of the element.
    FirstLine,
}

/// Selector cascades for a source, ranked most specific first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractionPlan {
    pub containers: Vec<&'static str>,
    pub title: Vec<ExtractionStrategy>,
    pub price: Vec<ExtractionStrategy>,
    pub location: Vec<ExtractionStrategy>,
    pub description: Vec<ExtractionStrategy>,
    pub image: Vec<ExtractionStrategy>,
    pub link: Vec<ExtractionStrategy>,
}

impl ExtractionPlan {
    /// Cascades that apply to any listing site.
    pub fn generic() -> Self {
        use ExtractionStrategy::*;
        Self {
            containers: vec![
                "[data-testid*='property-card']",
                ".property-card",
                ".listing-card",
                "article[class*='property']",
                "div[class*='srpTuple']",
            ],
            title: vec![
                Text("h2"),
                Text("h3"),
                Text("[class*='title']"),
                Text("a[title]"),
                FirstLine,
            ],
            price: vec![Text("[class*='price']"), Text("[class*='Price']"), PriceInText],
            location: vec![
                Text("[class*='locality']"),
                Text("[class*='location']"),
                Text("[class*='address']"),
                Text("address"),
            ],
            description: vec![Text("[class*='desc']"), Text("p")],
            image: vec![
                Attr {
                    selector: "img[data-src]",
                    attr: "data-src",
                },
                Attr {
                    selector: "img[src]",
                    attr: "src",
                },
            ],
            link: vec![Attr {
                selector: "a[href]",
                attr: "href",
            }],
        }
    }

    /// Put site-specific cascades ahead of the generic ones.
    pub fn site_specific(site: ExtractionPlan) -> Self {
        let mut generic = Self::generic();
        fn front<T>(mut specific: Vec<T>, generic: Vec<T>) -> Vec<T> {
            specific.extend(generic);
            specific
        }
        Self {
            containers: front(site.containers, std::mem::take(&mut generic.containers)),
            title: front(site.title, std::mem::take(&mut generic.title)),
            price: front(site.price, std::mem::take(&mut generic.price)),
            location: front(site.location, std::mem::take(&mut generic.location)),
            description: front(site.description, std::mem::take(&mut generic.description)),
            image: front(site.image, std::mem::take(&mut generic.image)),
            link: front(site.link, std::mem::take(&mut generic.link)),
        }
    }
}

/// Recover up to `limit` candidates from an HTML document. Never fails; an empty
/// result means nothing listing-shaped was found.
pub fn extract_listings(html: &str, page_url: &str, plan: &ExtractionPlan, limit: usize) -> Vec<RawCandidateRecord> {
    if limit == 0 {
        return Vec::new();
    }
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let elements = match find_containers(&document, &plan.containers) {
        Some((selector, elements)) => {
            debug!(selector, found = elements.len(), "listing containers matched");
            elements
        }
        None => {
            let elements = heuristic_blocks(&document);
            debug!(found = elements.len(), "no container selector matched; heuristic scan");
            elements
        }
    };

    let mut out = Vec::new();
    for element in elements {
        if out.len() >= limit {
            break;
        }
        if let Some(candidate) = extract_candidate(element, plan, base.as_ref()) {
            out.push(candidate);
        }
    }
    out
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(err) => {
            debug!(selector, error = %err, "skipping unparsable selector");
            None
        }
    }
}

fn find_containers<'a>(document: &'a Html, containers: &[&'static str]) -> Option<(&'static str, Vec<ElementRef<'a>>)> {
    containers.iter().find_map(|selector| {
        let sel = parse_selector(selector)?;
        let found: Vec<_> = document.select(&sel).collect();
        (!found.is_empty()).then_some((*selector, found))
    })
}

/// Innermost block elements whose size and wording look like a single listing. A
/// wrapper around several listings can pass the same checks, so any block holding a
/// qualifying block is dropped in favour of what it contains.
fn heuristic_blocks(document: &Html) -> Vec<ElementRef<'_>> {
    let Some(sel) = parse_selector(HEURISTIC_BLOCKS) else {
        return Vec::new();
    };
    let qualifying: Vec<ElementRef<'_>> = document
        .select(&sel)
        .filter(|element| {
            let text = element_text(*element);
            let len = text.chars().count();
            (HEURISTIC_MIN_CHARS..=HEURISTIC_MAX_CHARS).contains(&len)
                && PRICE_IN_TEXT.is_match(&text)
                && LISTING_CUE.is_match(&text)
        })
        .collect();
    qualifying
        .iter()
        .filter(|outer| {
            !qualifying
                .iter()
                .any(|inner| inner.ancestors().any(|a| a.id() == outer.id()))
        })
        .copied()
        .collect()
}

fn extract_candidate(element: ElementRef<'_>, plan: &ExtractionPlan, base: Option<&Url>) -> Option<RawCandidateRecord> {
    let title = first_text(element, &plan.title).map(|t| truncate_chars(&t, MAX_TITLE_CHARS))?;
    let price_text = first_text(element, &plan.price).unwrap_or_default();
    let location_text = first_text(element, &plan.location).unwrap_or_default();
    let description_text = first_text(element, &plan.description).filter(|d| *d != title);
    let images = first_values(element, &plan.image)
        .into_iter()
        .filter_map(|src| resolve_url(base, &src))
        .fold(Vec::new(), |mut acc, url| {
            if !acc.contains(&url) {
                acc.push(url);
            }
            acc
        });
    let source_link = first_values(element, &plan.link)
        .into_iter()
        .find_map(|href| resolve_url(base, &href));

    Some(RawCandidateRecord {
        title,
        price_text,
        location_text,
        description_text,
        images,
        source_link,
        synthetic: false,
    })
}

fn first_text(element: ElementRef<'_>, cascade: &[ExtractionStrategy]) -> Option<String> {
    cascade.iter().find_map(|strategy| apply_text(element, strategy))
}

fn apply_text(element: ElementRef<'_>, strategy: &ExtractionStrategy) -> Option<String> {
    match strategy {
        ExtractionStrategy::Text(selector) => {
            let sel = parse_selector(selector)?;
            element
                .select(&sel)
                .find_map(|n| non_empty(element_text(n)))
        }
        ExtractionStrategy::Attr { selector, attr } => {
            let sel = parse_selector(selector)?;
            element
                .select(&sel)
                .find_map(|n| n.value().attr(attr).and_then(|v| non_empty(v.trim().to_string())))
        }
        ExtractionStrategy::PriceInText => {
            let text = element_text(element);
            PRICE_IN_TEXT.find(&text).map(|m| m.as_str().trim().to_string())
        }
        ExtractionStrategy::FirstLine => element
            .text()
            .find_map(|segment| non_empty(collapse_whitespace(segment))),
    }
}

/// All values produced by the first strategy that yields any.
fn first_values(element: ElementRef<'_>, cascade: &[ExtractionStrategy]) -> Vec<String> {
    for strategy in cascade {
        let values: Vec<String> = match strategy {
            ExtractionStrategy::Attr { selector, attr } => match parse_selector(selector) {
                Some(sel) => element
                    .select(&sel)
                    .filter_map(|n| n.value().attr(attr))
                    .filter_map(|v| non_empty(v.trim().to_string()))
                    .collect(),
                None => Vec::new(),
            },
            other => apply_text(element, other).into_iter().collect(),
        };
        if !values.is_empty() {
            return values;
        }
    }
    Vec::new()
}

fn resolve_url(base: Option<&Url>, raw: &str) -> Option<String> {
    if raw.starts_with("data:") || raw.starts_with("javascript:") || raw.starts_with('#') {
        return None;
    }
    let url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Text content with node boundaries treated as whitespace, so adjacent cells do not fuse.
fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
