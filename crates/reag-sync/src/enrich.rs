//! Schema-guided enrichment through an external text-understanding service.
//!
//! Replies are untrusted. [`parse_reply`] recovers the JSON object from whatever the
//! model produced and checks it against the target shape before anything is merged.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reag_core::{AreaMeasure, AreaUnit, Contact, PriceType, PropertyType, RawCandidateRecord, MAX_BHK};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::rules;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment is disabled")]
    Disabled,
    #[error("enrichment service unreachable: {0}")]
    Connection(String),
    #[error("enrichment service returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("enrichment reply is not valid JSON: {0}")]
    Malformed(String),
    #[error("enrichment reply violates the target shape: {0}")]
    Shape(String),
}

/// Free-text prompt plus the JSON schema the reply must follow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentRequest {
    pub prompt: String,
    pub schema: Value,
}

#[async_trait]
pub trait EnrichmentService: Send + Sync {
    /// Raw reply text; interpretation is left to [`parse_reply`].
    async fn complete(&self, request: &EnrichmentRequest) -> Result<String, EnrichmentError>;
}

/// Ollama `/api/generate` client with structured-output `format`.
#[derive(Debug)]
pub struct OllamaEnrichmentService {
    config: LlmConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a Value,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaEnrichmentService {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("building enrichment http client")?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl EnrichmentService for OllamaEnrichmentService {
    async fn complete(&self, request: &EnrichmentRequest) -> Result<String, EnrichmentError> {
        if !self.config.enabled {
            return Err(EnrichmentError::Disabled);
        }
        let body = OllamaRequest {
            model: &self.config.model,
            prompt: &request.prompt,
            stream: false,
            format: &request.schema,
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };
        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EnrichmentError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EnrichmentError::Api { status, body });
        }

        let parsed: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        debug!(model = %self.config.model, chars = parsed.response.len(), "enrichment reply received");
        Ok(parsed.response)
    }
}

/// A reply must carry at least one of these; everything else is optional.
const LISTING_FIELDS: [&str; 5] = ["title", "price", "location", "propertyType", "bhk"];

/// JSON schema of the reply. `source` is deliberately absent: provenance never comes
/// from the model.
pub fn target_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "description": { "type": "string" },
            "price": { "type": "integer", "description": "whole rupees, no separators" },
            "priceType": { "type": "string", "enum": ["sale", "rent"] },
            "location": {
                "type": "object",
                "properties": {
                    "city": { "type": "string" },
                    "area": { "type": "string" },
                    "fullAddress": { "type": "string" }
                }
            },
            "propertyType": {
                "type": "string",
                "enum": ["apartment", "house", "villa", "plot", "commercial", "other"]
            },
            "bhk": { "type": "integer" },
            "area": {
                "type": "object",
                "properties": {
                    "size": { "type": "number" },
                    "unit": { "type": "string", "enum": ["sqft", "sqm", "acres", "sqyd"] }
                }
            },
            "amenities": { "type": "array", "items": { "type": "string" } },
            "contact": {
                "type": "object",
                "properties": {
                    "phone": { "type": "string" },
                    "email": { "type": "string" },
                    "agent": { "type": "string" }
                }
            },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "anyOf": LISTING_FIELDS
            .iter()
            .map(|field| json!({ "required": [field] }))
            .collect::<Vec<_>>()
    })
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

pub fn build_request(candidate: &RawCandidateRecord, city: &str, max_input_chars: usize) -> EnrichmentRequest {
    let description = candidate.description_text.as_deref().unwrap_or("");
    let prompt = format!(
        "You normalize Indian real-estate listings into JSON.\n\
         Rules:\n\
         - price: integer rupees. 1 crore = 10000000, 1 lakh = 100000.\n\
         - priceType: \"rent\" for monthly rent or lease, otherwise \"sale\".\n\
         - bhk: integer bedroom count only if stated; omit it otherwise.\n\
         - area: prefer square feet.\n\
         - confidence: 0 to 1, how sure you are of the extracted fields.\n\
         Reply with JSON only.\n\n\
         City searched: {city}\n\
         Title: {title}\n\
         Price: {price}\n\
         Location: {location}\n\
         Description: {description}\n",
        city = clip(city, 100),
        title = clip(&candidate.title, 300),
        price = clip(&candidate.price_text, 100),
        location = clip(&candidate.location_text, 300),
        description = clip(description, max_input_chars),
    );
    EnrichmentRequest {
        prompt,
        schema: target_schema(),
    }
}

/// Pull the JSON object out of a reply that may be wrapped in a markdown fence or prose.
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after = start + 3;
        let content_start = trimmed[after..].find('\n').map(|i| after + i + 1).unwrap_or(after);
        if let Some(end) = trimmed[content_start..].find("```") {
            return trimmed[content_start..content_start + end].trim();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplyLocation {
    pub city: Option<String>,
    pub area: Option<String>,
    #[serde(alias = "full_address")]
    pub full_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ReplyArea {
    pub size: Option<NumberOrText>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ReplyContact {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub agent: Option<String>,
}

/// Reply as the model sent it. Unknown keys (including any `source`) are ignored.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrichmentReply {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<NumberOrText>,
    #[serde(alias = "price_type")]
    pub price_type: Option<String>,
    pub location: Option<ReplyLocation>,
    #[serde(alias = "property_type")]
    pub property_type: Option<String>,
    pub bhk: Option<NumberOrText>,
    pub area: Option<ReplyArea>,
    pub amenities: Option<Vec<String>>,
    pub contact: Option<ReplyContact>,
    pub confidence: Option<f64>,
}

/// Reply fields that passed validation, ready to merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedReply {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub price_type: Option<PriceType>,
    pub city: Option<String>,
    pub area_name: Option<String>,
    pub full_address: Option<String>,
    pub property_type: Option<PropertyType>,
    pub bhk: Option<u32>,
    pub area: Option<AreaMeasure>,
    pub amenities: Option<BTreeSet<String>>,
    pub contact: Contact,
    /// Clamped to [0.1, 1.0]; 0.5 when the reply gives none.
    pub confidence: f64,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn shape(detail: impl Into<String>) -> EnrichmentError {
    EnrichmentError::Shape(detail.into())
}

fn validate_price(price: Option<NumberOrText>) -> Result<Option<i64>, EnrichmentError> {
    match price {
        None => Ok(None),
        Some(NumberOrText::Number(n)) if n.is_finite() && n >= 0.0 && n <= i64::MAX as f64 => Ok(Some(n.round() as i64)),
        Some(NumberOrText::Number(n)) => Err(shape(format!("price {n} is not a non-negative amount"))),
        Some(NumberOrText::Text(t)) if t.trim().is_empty() => Ok(None),
        Some(NumberOrText::Text(t)) => rules::parse_price(&t)
            .map(Some)
            .ok_or_else(|| shape(format!("price {t:?} is not a number"))),
    }
}

fn validate_bhk(bhk: Option<NumberOrText>) -> Result<Option<u32>, EnrichmentError> {
    match bhk {
        None => Ok(None),
        Some(NumberOrText::Number(n)) if n.fract() == 0.0 && (0.0..=f64::from(MAX_BHK)).contains(&n) => Ok(Some(n as u32)),
        Some(NumberOrText::Number(n)) => Err(shape(format!("bhk {n} is not a bedroom count"))),
        Some(NumberOrText::Text(t)) => match rules::extract_bhk(&t).or_else(|| t.trim().parse().ok()) {
            Some(n) if n <= MAX_BHK => Ok(Some(n)),
            Some(n) => Err(shape(format!("bhk {n} is not a bedroom count"))),
            None => Ok(None),
        },
    }
}

fn validate_area(area: Option<ReplyArea>) -> Result<Option<AreaMeasure>, EnrichmentError> {
    let Some(area) = area else {
        return Ok(None);
    };
    let size = match area.size {
        None => return Ok(None),
        Some(NumberOrText::Number(n)) => n,
        Some(NumberOrText::Text(t)) => match rules::parse_area(&t) {
            Some(parsed) if area.unit.is_none() => return Ok(Some(parsed)),
            _ => t
                .replace(',', "")
                .trim()
                .parse::<f64>()
                .map_err(|_| shape(format!("area size {t:?} is not a number")))?,
        },
    };
    if !(size.is_finite() && size >= 0.0) {
        return Err(shape(format!("area size {size} is not a non-negative number")));
    }
    let unit = match area.unit.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        None => AreaUnit::Sqft,
        Some(u) => rules::parse_area_unit(u).ok_or_else(|| shape(format!("unknown area unit {u:?}")))?,
    };
    Ok(Some(AreaMeasure { size, unit }))
}

/// Parse and validate a raw reply against the target shape.
pub fn parse_reply(raw: &str) -> Result<ValidatedReply, EnrichmentError> {
    let text = extract_json_from_response(raw);
    let value: Value = serde_json::from_str(text).map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(shape("reply is not a JSON object"));
    }
    let reply: EnrichmentReply = serde_json::from_value(value).map_err(|e| shape(e.to_string()))?;

    let price_type = match non_blank(reply.price_type) {
        None => None,
        Some(pt) => Some(rules::parse_price_type(&pt).ok_or_else(|| shape(format!("unknown priceType {pt:?}")))?),
    };
    let location = reply.location.unwrap_or_default();
    let contact = reply.contact.unwrap_or_default();

    let validated = ValidatedReply {
        title: non_blank(reply.title),
        description: non_blank(reply.description),
        price: validate_price(reply.price)?,
        price_type,
        city: non_blank(location.city),
        area_name: non_blank(location.area),
        full_address: non_blank(location.full_address),
        property_type: non_blank(reply.property_type).map(|pt| rules::parse_property_type(&pt)),
        bhk: validate_bhk(reply.bhk)?,
        area: validate_area(reply.area)?,
        amenities: reply
            .amenities
            .map(rules::clean_amenities)
            .filter(|set| !set.is_empty()),
        contact: Contact {
            phone: non_blank(contact.phone),
            email: non_blank(contact.email),
            agent: non_blank(contact.agent),
        },
        confidence: match reply.confidence {
            Some(c) if c.is_finite() => c.clamp(0.1, 1.0),
            _ => 0.5,
        },
    };

    if validated.title.is_none()
        && validated.price.is_none()
        && validated.city.is_none()
        && validated.area_name.is_none()
        && validated.full_address.is_none()
        && validated.property_type.is_none()
        && validated.bhk.is_none()
    {
        return Err(shape("reply carries no listing fields"));
    }
    Ok(validated)
}
