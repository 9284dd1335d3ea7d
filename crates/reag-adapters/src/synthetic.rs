//! Deterministic demo listings used when a source yields nothing extractable.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reag_core::RawCandidateRecord;

use crate::city_slug;

/// Plausible sale price range for a source, in lakh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBand {
    pub min_lakh: f64,
    pub max_lakh: f64,
}

impl Default for PriceBand {
    fn default() -> Self {
        Self {
            min_lakh: 30.0,
            max_lakh: 450.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticProfile {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub price_band: PriceBand,
}

const LAYOUTS: &[(u32, &str)] = &[
    (1, "Apartment"),
    (2, "Apartment"),
    (2, "Flat"),
    (3, "Apartment"),
    (3, "Villa"),
    (4, "Independent House"),
    (4, "Villa"),
];

const FEATURES: &[&str] = &[
    "Gym",
    "Swimming Pool",
    "Covered Parking",
    "Power Backup",
    "24x7 Security",
    "Lift",
    "Clubhouse",
    "Garden",
];

fn localities(city: &str) -> &'static [&'static str] {
    match city_slug(city).as_str() {
        "mumbai" => &["Andheri West", "Powai", "Bandra West", "Thane West", "Malad East", "Chembur"],
        "pune" => &["Baner", "Hinjewadi", "Kharadi", "Wakad", "Kothrud", "Viman Nagar"],
        "bangalore" | "bengaluru" => &["Whitefield", "Koramangala", "HSR Layout", "Electronic City", "Hebbal"],
        "delhi" | "new-delhi" => &["Dwarka", "Saket", "Rohini", "Vasant Kunj", "Lajpat Nagar"],
        "hyderabad" => &["Gachibowli", "Kondapur", "Madhapur", "Kukatpally", "Banjara Hills"],
        "chennai" => &["Adyar", "Velachery", "OMR", "Anna Nagar", "Porur"],
        _ => &["Central", "North Extension", "Old Town", "Lake View", "Ring Road"],
    }
}

fn stable_hash(value: &str) -> u64 {
    // FNV-1a: stable across builds, unlike the std hasher.
    value.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn format_price(lakh: f64) -> String {
    if lakh >= 100.0 {
        format!("₹{:.2} Cr", lakh / 100.0)
    } else {
        format!("₹{} Lakh", lakh.round() as u64)
    }
}

/// Produce exactly `limit` synthetic candidates. The same `(profile, city, limit, seed)`
/// always yields the same candidates, so repeated runs collapse onto the same fingerprints.
pub fn generate_synthetic(profile: &SyntheticProfile, city: &str, limit: usize, seed: u64) -> Vec<RawCandidateRecord> {
    let city_key = city_slug(city);
    let mut rng = StdRng::seed_from_u64(seed ^ stable_hash(&profile.source_id) ^ stable_hash(&city_key).rotate_left(17));
    let areas = localities(city);
    let base_url = profile.base_url.trim_end_matches('/');

    (0..limit)
        .map(|i| {
            let (bhk, kind) = LAYOUTS.choose(&mut rng).copied().unwrap_or((2, "Apartment"));
            let locality = areas.choose(&mut rng).copied().unwrap_or("Central");
            let band = profile.price_band;
            let lakh = rng.gen_range(band.min_lakh..=band.max_lakh.max(band.min_lakh)) * (0.7 + 0.15 * bhk as f64);
            let sqft = 450 + bhk * rng.gen_range(280..=420);
            let features: Vec<&str> = FEATURES.choose_multiple(&mut rng, 3).copied().collect();

            RawCandidateRecord {
                title: format!("{bhk} BHK {kind} in {locality}"),
                price_text: format_price(lakh),
                location_text: format!("{locality}, {city}"),
                description_text: Some(format!(
                    "{bhk} BHK {} of {sqft} sqft in {locality}, {city}. Amenities: {}. Listed on {}.",
                    kind.to_lowercase(),
                    features.join(", "),
                    profile.display_name
                )),
                images: Vec::new(),
                source_link: Some(format!(
                    "{base_url}/demo-listing/{city_key}/{}-{seed:x}-{i}",
                    profile.source_id
                )),
                synthetic: true,
            }
        })
        .collect()
}
