//! Deterministic parsing rules shared by the enrichment-reply validator and the
//! fallback normalizer.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use reag_core::{AreaMeasure, AreaUnit, Location, PriceType, PropertyType};
use regex::Regex;

const CRORE: f64 = 10_000_000.0;
const LAKH: f64 = 100_000.0;
const THOUSAND: f64 = 1_000.0;

static PRICE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(crores?|cr|lakhs?|lacs?|lac|l|thousand|k)?\b")
        .expect("price pattern should compile")
});

static CRORE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:crores?|cr)\b").expect("crore pattern should compile"));

static LAKH_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:lakhs?|lacs?|lac)\b").expect("lakh pattern should compile"));

static CURRENCY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:₹|rs\.?|inr)").expect("currency pattern should compile"));

static BHK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^\d.])(\d{1,2})\s*(?:bhk|bedrooms?|beds?|br)\b").expect("bhk pattern should compile")
});

static AREA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+(?:\.\d+)?)\s*(sq\.?\s*ft\.?|sqft|square\s+feet|sq\.?\s*yds?\.?|sqyds?|square\s+yards?|gaj|sq\.?\s*m(?:tr)?s?\.?|sqm|square\s+met(?:er|re)s?|acres?)",
    )
    .expect("area pattern should compile")
});

static RENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:for rent|rent|rental|lease|per month|monthly)\b|/\s*(?:month|mo)\b")
        .expect("rent pattern should compile")
});

static AMENITIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("Gym", r"\b(?:gym|gymnasium|fitness cent(?:er|re))\b"),
        ("Swimming Pool", r"\b(?:swimming pool|pool)\b"),
        ("Parking", r"\b(?:parking|car park|garage)\b"),
        ("Power Backup", r"\b(?:power backup|power back-up|generator)\b"),
        ("Security", r"\b(?:security|cctv|gated community|gated)\b"),
        ("Lift", r"\b(?:lift|lifts|elevators?)\b"),
        ("Clubhouse", r"\b(?:clubhouse|club house)\b"),
        ("Garden", r"\b(?:garden|landscaped|park)\b"),
        ("Play Area", r"\b(?:play area|kids play|children'?s play)\b"),
        ("Furnished", r"\b(?:fully furnished|semi-furnished|semi furnished|furnished)\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        let re = Regex::new(&format!("(?i){pattern}")).expect("amenity pattern should compile");
        (name, re)
    })
    .collect()
});

/// Parse free-form price text into whole rupees.
///
/// Crore/lakh/thousand markers scale the leading number. A unitless number behind a
/// currency prefix is read as lakh only when it is ungrouped and below 1000 (`₹85`);
/// grouped or larger amounts (`₹28,000`, `₹1000`) are already whole rupees.
pub fn parse_price(text: &str) -> Option<i64> {
    let grouped = text.contains(',');
    let cleaned = text.replace(',', "");
    let caps = PRICE_NUMBER.captures(&cleaned)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;

    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit.starts_with("cr") => CRORE,
        Some(unit) if unit.starts_with('l') => LAKH,
        Some(_) => THOUSAND,
        None if CRORE_WORD.is_match(&cleaned) => CRORE,
        None if LAKH_WORD.is_match(&cleaned) => LAKH,
        None if CURRENCY_PREFIX.is_match(&cleaned) && !grouped && number < 1000.0 => LAKH,
        None => 1.0,
    };
    let value = (number * multiplier).round();
    (value.is_finite() && value >= 0.0 && value <= i64::MAX as f64).then_some(value as i64)
}

/// First integer directly followed by a bedroom marker. Never invents a count.
pub fn extract_bhk(text: &str) -> Option<u32> {
    BHK.captures(text)?.get(1)?.as_str().parse().ok()
}

pub fn parse_area_unit(unit: &str) -> Option<AreaUnit> {
    let u: String = unit
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect();
    match u.as_str() {
        "sqft" | "squarefeet" | "squarefoot" | "ft" => Some(AreaUnit::Sqft),
        "sqm" | "sqmt" | "sqmtr" | "sqmtrs" | "sqms" | "squaremeter" | "squaremeters" | "squaremetre"
        | "squaremetres" | "m" => Some(AreaUnit::Sqm),
        "sqyd" | "sqyds" | "squareyard" | "squareyards" | "gaj" | "yd" => Some(AreaUnit::Sqyd),
        "acre" | "acres" => Some(AreaUnit::Acres),
        _ => None,
    }
}

pub fn parse_area(text: &str) -> Option<AreaMeasure> {
    let cleaned = text.replace(',', "");
    let caps = AREA.captures(&cleaned)?;
    let size: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = parse_area_unit(caps.get(2)?.as_str())?;
    Some(AreaMeasure { size, unit })
}

pub fn classify_price_type(text: &str) -> PriceType {
    if RENT.is_match(text) {
        PriceType::Rent
    } else {
        PriceType::Sale
    }
}

/// Keyword classification, most specific kinds first.
pub fn classify_property_type(text: &str) -> PropertyType {
    // Padded word sequence so needles only match whole words ("clubhouse" is not a house).
    let words = format!(
        " {} ",
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let has = |needles: &[&str]| needles.iter().any(|n| words.contains(&format!(" {n} ")));
    if has(&["villa", "bungalow"]) {
        PropertyType::Villa
    } else if has(&["plot", "land", "acreage"]) {
        PropertyType::Plot
    } else if has(&["office", "shop", "showroom", "warehouse", "commercial", "retail space", "godown"]) {
        PropertyType::Commercial
    } else if has(&["independent house", "independent floor", "builder floor", "row house", "house", "duplex"]) {
        PropertyType::House
    } else if has(&["apartment", "flat", "penthouse", "studio", "bhk", "condo"]) {
        PropertyType::Apartment
    } else {
        PropertyType::Other
    }
}

/// Parse a property-type name from an enrichment reply, tolerating synonyms.
pub fn parse_property_type(value: &str) -> PropertyType {
    match value.trim().to_ascii_lowercase().as_str() {
        "apartment" => PropertyType::Apartment,
        "house" => PropertyType::House,
        "villa" => PropertyType::Villa,
        "plot" => PropertyType::Plot,
        "commercial" => PropertyType::Commercial,
        "other" => PropertyType::Other,
        other => classify_property_type(other),
    }
}

pub fn parse_price_type(value: &str) -> Option<PriceType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sale" | "sell" | "buy" | "resale" => Some(PriceType::Sale),
        "rent" | "rental" | "lease" => Some(PriceType::Rent),
        _ => None,
    }
}

pub fn extract_amenities(text: &str) -> BTreeSet<String> {
    AMENITIES
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Trim and drop blanks; the set removes exact repeats.
pub fn clean_amenities<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Exact-value dedup that keeps first-seen order.
pub fn dedup_exact(values: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Split scraped location text into a location for `city`. The area is the first
/// comma-separated part that is not the city itself.
pub fn split_location(location_text: &str, city: &str) -> Location {
    let text = location_text.trim();
    let area = text
        .split(',')
        .map(str::trim)
        .find(|part| !part.is_empty() && !part.eq_ignore_ascii_case(city))
        .map(ToString::to_string);
    Location {
        city: city.trim().to_string(),
        area,
        full_address: (!text.is_empty()).then(|| text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_markers_scale_leading_number() {
        assert_eq!(parse_price("₹1.2 Cr"), Some(12_000_000));
        assert_eq!(parse_price("50 lakhs"), Some(5_000_000));
        assert_eq!(parse_price("25L"), Some(2_500_000));
        assert_eq!(parse_price("5000000"), Some(5_000_000));
        assert_eq!(parse_price("₹ 82 Lac"), Some(8_200_000));
        assert_eq!(parse_price("Rs. 45 thousand"), Some(45_000));
        assert_eq!(parse_price("12k"), Some(12_000));
    }

    #[test]
    fn currency_prefixed_bare_number_defaults_to_lakh() {
        assert_eq!(parse_price("₹85"), Some(8_500_000));
        assert_eq!(parse_price("₹28,000/month"), Some(28_000));
        assert_eq!(parse_price("Rs 4500000"), Some(4_500_000));
        assert_eq!(parse_price("₹999"), Some(99_900_000));
        assert_eq!(parse_price("₹1000"), Some(1_000));
        assert_eq!(parse_price("Rs. 999.5"), Some(99_950_000));
        assert_eq!(parse_price("999"), Some(999));
    }

    #[test]
    fn unparseable_price_is_absent() {
        assert_eq!(parse_price("Price on request"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn bhk_requires_bedroom_marker() {
        assert_eq!(extract_bhk("2 BHK apartment"), Some(2));
        assert_eq!(extract_bhk("Spacious 3 bedroom villa"), Some(3));
        assert_eq!(extract_bhk("4BHK penthouse"), Some(4));
        assert_eq!(extract_bhk("Studio apartment"), None);
        assert_eq!(extract_bhk("Plot 250 sqyd"), None);
        assert_eq!(extract_bhk("2.5 BHK duplex"), None);
        assert_eq!(extract_bhk("Spacious 2.5 BHK, also 3 BHK units"), Some(3));
        assert_eq!(extract_bhk("Flat no. 12 BHK-style layout"), Some(12));
    }

    #[test]
    fn area_units_are_recognised() {
        assert_eq!(
            parse_area("1,450 sq.ft carpet"),
            Some(AreaMeasure {
                size: 1450.0,
                unit: AreaUnit::Sqft
            })
        );
        assert_eq!(parse_area("300 sqyd").map(|a| a.unit), Some(AreaUnit::Sqyd));
        assert_eq!(parse_area("2.5 acres farmland").map(|a| a.unit), Some(AreaUnit::Acres));
        assert_eq!(parse_area("120 sq m").map(|a| a.unit), Some(AreaUnit::Sqm));
        assert_eq!(parse_area("no size given"), None);
    }

    #[test]
    fn property_and_price_type_keywords() {
        assert_eq!(classify_property_type("3 BHK Villa in Kharadi"), PropertyType::Villa);
        assert_eq!(classify_property_type("2 BHK Flat for Sale"), PropertyType::Apartment);
        assert_eq!(classify_property_type("Residential Plot"), PropertyType::Plot);
        assert_eq!(classify_property_type("Office space in BKC"), PropertyType::Commercial);
        assert_eq!(classify_property_type("Something"), PropertyType::Other);
        assert_eq!(
            classify_property_type("2 BHK Apartment with clubhouse"),
            PropertyType::Apartment
        );
        assert_eq!(classify_price_type("1 BHK for Rent ₹28,000/month"), PriceType::Rent);
        assert_eq!(classify_price_type("2 BHK Flat for Sale"), PriceType::Sale);
        assert_eq!(parse_property_type("Independent House"), PropertyType::House);
        assert_eq!(parse_price_type("Rental"), Some(PriceType::Rent));
        assert_eq!(parse_price_type("auction"), None);
    }

    #[test]
    fn amenities_and_lists_are_deduplicated() {
        let found = extract_amenities("Gym, swimming pool, covered parking and a gym for kids");
        assert_eq!(
            found.into_iter().collect::<Vec<_>>(),
            vec!["Gym", "Parking", "Swimming Pool"]
        );
        assert_eq!(clean_amenities([" Gym", "Gym", ""]).len(), 1);
        assert_eq!(
            dedup_exact(vec!["a".into(), "b".into(), "a".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn location_split_skips_city_part() {
        let loc = split_location("Mumbai, Powai", "Mumbai");
        assert_eq!(loc.area.as_deref(), Some("Powai"));
        assert_eq!(loc.full_address.as_deref(), Some("Mumbai, Powai"));
        let empty = split_location("  ", "Pune");
        assert_eq!(empty.city, "Pune");
        assert_eq!(empty.area, None);
        assert_eq!(empty.full_address, None);
    }
}
