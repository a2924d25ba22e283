//! Raw candidate fields → canonical [`ListingRecord`].
//!
//! Everything here is pure: no I/O, no clock. Prices are parsed with integer
//! arithmetic so `2.8 tỷ` is exactly `2_800_000_000`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{ListingRecord, PropertyType};
use crate::sources::CandidateFields;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing required field: {0}")]
    Missing(&'static str),
    #[error("unparseable {field}: {text:?}")]
    Unparseable { field: &'static str, text: String },
}

impl NormalizeError {
    /// Missing data is a validation failure; malformed data is a parse failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, NormalizeError::Missing(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedPrice {
    Total(i64),
    PerSqm(i64),
}

impl ParsedPrice {
    pub fn resolve(self, area_sqm: f64) -> Option<i64> {
        match self {
            ParsedPrice::Total(v) => Some(v),
            ParsedPrice::PerSqm(v) => {
                let total = (v as f64 * area_sqm).round();
                (total.is_finite() && total >= 0.0 && total <= i64::MAX as f64)
                    .then_some(total as i64)
            }
        }
    }
}

/// Ordered label table; first `contains` match wins, so more specific labels
/// come before the generic ones they contain.
pub const PROPERTY_TYPE_LABELS: &[(&str, PropertyType)] = &[
    ("nhà xưởng", PropertyType::Other),
    ("nhà đất", PropertyType::Other),
    ("căn hộ", PropertyType::Apartment),
    ("can ho", PropertyType::Apartment),
    ("chung cư", PropertyType::Apartment),
    ("chung cu", PropertyType::Apartment),
    ("condotel", PropertyType::Apartment),
    ("penthouse", PropertyType::Apartment),
    ("apartment", PropertyType::Apartment),
    ("condo", PropertyType::Apartment),
    ("flat", PropertyType::Apartment),
    ("nhà phố", PropertyType::Townhouse),
    ("nha pho", PropertyType::Townhouse),
    ("nhà mặt phố", PropertyType::Townhouse),
    ("liền kề", PropertyType::Townhouse),
    ("lien ke", PropertyType::Townhouse),
    ("shophouse", PropertyType::Townhouse),
    ("townhouse", PropertyType::Townhouse),
    ("town house", PropertyType::Townhouse),
    ("biệt thự", PropertyType::House),
    ("biet thu", PropertyType::House),
    ("villa", PropertyType::House),
    ("nhà riêng", PropertyType::House),
    ("nha rieng", PropertyType::House),
    ("đất nền", PropertyType::Land),
    ("dat nen", PropertyType::Land),
    ("đất", PropertyType::Land),
    ("land", PropertyType::Land),
    ("plot", PropertyType::Land),
    ("nhà", PropertyType::House),
    ("house", PropertyType::House),
    ("home", PropertyType::House),
];

const NOT_DISCLOSED: &[&str] = &[
    "thỏa thuận",
    "thoả thuận",
    "thoa thuan",
    "liên hệ",
    "lien he",
    "negotiable",
    "contact",
];

static NUMBER_WITH_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:[.,]\d+)*)\s*([\p{L}\p{M}]+)?").expect("valid price regex")
});
static FIRST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)*").expect("valid number regex"));
static FIRST_INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid int regex"));
static TRAILING_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4,})(?:\.[A-Za-z0-9]+)?/?$").expect("valid id regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Build a canonical record from adapter output. `seen_at` becomes both
/// `first_seen_at` and `last_seen_at`; the reconciler decides what survives.
pub fn normalize(
    source_id: &str,
    fields: &CandidateFields,
    seen_at: DateTime<Utc>,
) -> Result<ListingRecord, NormalizeError> {
    let title = required_text(fields.title.as_deref(), "title")?;
    let url = required_text(fields.url.as_deref(), "url")?;
    let location_text = fields
        .location
        .as_deref()
        .map(clean_text)
        .unwrap_or_default();

    let price_text = required_text(fields.price_text.as_deref(), "price")?;
    let area_text = required_text(fields.area_text.as_deref(), "area")?;
    let area_sqm = parse_area(&area_text)?;
    let price_minor = parse_price(&price_text)?
        .resolve(area_sqm)
        .ok_or_else(|| NormalizeError::Unparseable {
            field: "price",
            text: price_text.clone(),
        })?;

    let property_type = fields
        .property_type
        .as_deref()
        .map(property_type_from_label)
        .unwrap_or(PropertyType::Other);

    let external_id = fields
        .external_id
        .as_deref()
        .map(clean_text)
        .filter(|id| !id.is_empty())
        .or_else(|| external_id_from_url(&url));

    let content_hash = content_hash(&title, price_minor, area_sqm, &location_text);

    Ok(ListingRecord {
        source_id: source_id.to_string(),
        external_id,
        title,
        location_text,
        property_type,
        price_minor,
        area_sqm,
        bedrooms: fields.bedrooms.as_deref().and_then(parse_count),
        bathrooms: fields.bathrooms.as_deref().and_then(parse_count),
        url,
        image_url: fields
            .image_url
            .as_deref()
            .map(clean_text)
            .filter(|s| !s.is_empty()),
        content_hash,
        first_seen_at: seen_at,
        last_seen_at: seen_at,
    })
}

fn required_text(value: Option<&str>, field: &'static str) -> Result<String, NormalizeError> {
    value
        .map(clean_text)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::Missing(field))
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn clean_text(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

/// Parse localized price text into minor units.
///
/// Supports scale words (`tỷ` ×1e9, `triệu` ×1e6, `nghìn` ×1e3 and their
/// ASCII/English forms), compound amounts (`3 tỷ 500 triệu`, `3 tỷ 500`),
/// currency words, grouping separators and per-m² prices.
pub fn parse_price(text: &str) -> Result<ParsedPrice, NormalizeError> {
    let lowered = clean_text(text).to_lowercase();
    if lowered.is_empty() || NOT_DISCLOSED.iter().any(|w| lowered.contains(w)) {
        return Err(NormalizeError::Missing("price"));
    }
    let unparseable = || NormalizeError::Unparseable {
        field: "price",
        text: text.to_string(),
    };

    let (amount, per_sqm) = match lowered.split_once('/') {
        Some((amount, unit)) if unit.trim_start().starts_with('m') => (amount, true),
        _ => (lowered.as_str(), false),
    };

    let mut total: i128 = 0;
    let mut matched = false;
    let mut last_end = 0;
    // Scale of the previous term; a bare number right after `3 tỷ` means
    // `500 triệu`. Any other text between terms ends the amount.
    let mut previous_scale: Option<i128> = None;
    for caps in NUMBER_WITH_UNIT.captures_iter(amount) {
        let gap = &amount[last_end..caps.get(0).map_or(last_end, |m| m.start())];
        if matched && !gap.trim_matches(|c: char| c.is_whitespace() || c == ',').is_empty() {
            break;
        }
        let number = parse_decimal(&caps[1]).ok_or_else(unparseable)?;
        let (scale, ends_amount) = match caps.get(2).map(|m| m.as_str()) {
            Some(word) => match scale_word(word) {
                Some(scale) => (scale, false),
                None => (inherited_scale(previous_scale), true),
            },
            None => (inherited_scale(previous_scale), true),
        };
        total = total
            .checked_add(number.scaled(scale).ok_or_else(unparseable)?)
            .ok_or_else(unparseable)?;
        matched = true;
        if ends_amount {
            break;
        }
        previous_scale = Some(scale);
        last_end = caps.get(0).map_or(last_end, |m| m.end());
    }
    if !matched {
        return Err(unparseable());
    }
    let total = i64::try_from(total).map_err(|_| unparseable())?;
    Ok(if per_sqm {
        ParsedPrice::PerSqm(total)
    } else {
        ParsedPrice::Total(total)
    })
}

fn inherited_scale(previous: Option<i128>) -> i128 {
    previous.map(|s| (s / 1000).max(1)).unwrap_or(1)
}

fn scale_word(word: &str) -> Option<i128> {
    match word {
        "tỷ" | "tỉ" | "ty" | "ti" | "billion" | "bn" => Some(1_000_000_000),
        "triệu" | "trieu" | "tr" | "million" | "mil" => Some(1_000_000),
        "nghìn" | "ngàn" | "nghin" | "ngan" | "k" | "thousand" => Some(1_000),
        "đ" | "vnđ" | "vnd" | "đồng" | "dong" => Some(1),
        _ => None,
    }
}

/// Parse area text (`85m²`, `85,5 m2`, `1.200 sqm`, `0,5 ha`) into square meters.
pub fn parse_area(text: &str) -> Result<f64, NormalizeError> {
    let lowered = clean_text(text).to_lowercase();
    let unparseable = || NormalizeError::Unparseable {
        field: "area",
        text: text.to_string(),
    };
    let m = FIRST_NUMBER.find(&lowered).ok_or_else(unparseable)?;
    let number = parse_decimal(m.as_str()).ok_or_else(unparseable)?;
    let rest = lowered[m.end()..].trim_start();
    let factor = if rest.starts_with("ha") || rest.starts_with("hecta") {
        10_000.0
    } else {
        1.0
    };
    let area = number.to_f64() * factor;
    if area.is_finite() && area > 0.0 {
        Ok(area)
    } else {
        Err(unparseable())
    }
}

/// Map a free-text category label onto the closed enum; unknown → `Other`.
pub fn property_type_from_label(label: &str) -> PropertyType {
    let label = clean_text(label).to_lowercase();
    if let Some(t) = PropertyType::parse(&label) {
        return t;
    }
    PROPERTY_TYPE_LABELS
        .iter()
        .find(|(needle, _)| label.contains(needle))
        .map(|(_, t)| *t)
        .unwrap_or(PropertyType::Other)
}

fn parse_count(text: &str) -> Option<u32> {
    FIRST_INTEGER
        .find(text)
        .and_then(|m| m.as_str().parse::<u32>().ok())
}

/// Trailing numeric id of the URL's last path segment, e.g. `...-pr38765432`
/// or `/112345678.htm`.
pub fn external_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.trim_end_matches('/');
    let segment = path.rsplit('/').next()?;
    TRAILING_ID
        .captures(segment)
        .map(|caps| caps[1].to_string())
}

pub fn content_hash(title: &str, price_minor: i64, area_sqm: f64, location: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{:.2}|{}",
            clean_text(title),
            price_minor,
            area_sqm,
            clean_text(location).to_lowercase()
        )
        .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

/// `mantissa / 10^scale`, kept exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    fn scaled(self, unit: i128) -> Option<i128> {
        let divisor = 10_i128.checked_pow(self.scale)?;
        let numerator = self.mantissa.checked_mul(unit)?;
        // round half up
        let doubled = numerator.checked_mul(2)?.checked_add(divisor)?;
        Some(doubled / divisor.checked_mul(2)?)
    }

    fn to_f64(self) -> f64 {
        self.mantissa as f64 / 10_f64.powi(self.scale as i32)
    }
}

/// Separator rules: with both `.` and `,` the last one is the decimal point;
/// a repeated separator groups thousands; a single separator followed by
/// exactly three digits groups too (unless the integer part is `0`);
/// otherwise it is the decimal point.
fn parse_decimal(token: &str) -> Option<Decimal> {
    let dots = token.matches('.').count();
    let commas = token.matches(',').count();
    let decimal_sep = if dots > 0 && commas > 0 {
        token.rfind(['.', ',']).map(|i| token.as_bytes()[i] as char)
    } else if dots + commas == 1 {
        let sep = if dots == 1 { '.' } else { ',' };
        let (int_part, frac) = token.split_once(sep)?;
        if frac.len() == 3 && int_part != "0" {
            None
        } else {
            Some(sep)
        }
    } else {
        None
    };

    let (int_part, frac_part) = match decimal_sep {
        Some(sep) => token.rsplit_once(sep)?,
        None => (token, ""),
    };
    let digits: String = int_part
        .chars()
        .chain(frac_part.chars())
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    Some(Decimal {
        mantissa: digits.parse().ok()?,
        scale: frac_part.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(text: &str) -> i64 {
        match parse_price(text).unwrap() {
            ParsedPrice::Total(v) => v,
            other => panic!("expected total, got {:?}", other),
        }
    }

    fn fields() -> CandidateFields {
        CandidateFields {
            title: Some("  Căn hộ   cao cấp tại Quận 2 ".into()),
            location: Some("Quận 2,\n TP.HCM".into()),
            price_text: Some("3.2 tỷ".into()),
            area_text: Some("85m²".into()),
            property_type: Some("Căn hộ".into()),
            bedrooms: Some("3 PN".into()),
            bathrooms: Some("2".into()),
            url: Some("https://chotot.com/mua-ban-can-ho/112345678.htm".into()),
            image_url: None,
            external_id: None,
        }
    }

    #[test]
    fn vietnamese_scale_words() {
        assert_eq!(total("2.8 tỷ"), 2_800_000_000);
        assert_eq!(total("500 triệu"), 500_000_000);
        assert_eq!(total("1,25 tỷ"), 1_250_000_000);
        assert_eq!(total("12 tỷ"), 12_000_000_000);
        assert_eq!(total("2.8 Tỷ"), 2_800_000_000);
        assert_eq!(total("750 nghìn"), 750_000);
        assert_eq!(total("2.8 ty"), 2_800_000_000);
        assert_eq!(total("1.5 billion"), 1_500_000_000);
    }

    #[test]
    fn compound_amounts() {
        assert_eq!(total("3 tỷ 500 triệu"), 3_500_000_000);
        assert_eq!(total("3 tỷ 500"), 3_500_000_000);
        assert_eq!(total("1.500 triệu"), 1_500_000_000);
        assert_eq!(total("3 tỷ, 500 triệu"), 3_500_000_000);
    }

    #[test]
    fn trailing_text_ends_the_amount() {
        assert_eq!(total("2 tỷ (3 PN)"), 2_000_000_000);
        assert_eq!(total("2,5 tỷ - sổ hồng 2 mặt tiền"), 2_500_000_000);
        assert_eq!(total("850 triệu còn 3 căn"), 850_000_000);
    }

    #[test]
    fn plain_amounts_with_grouping() {
        assert_eq!(total("3.200.000.000 đ"), 3_200_000_000);
        assert_eq!(total("3,200,000,000 VND"), 3_200_000_000);
        assert_eq!(total("3200000000"), 3_200_000_000);
        assert_eq!(total("1.234.567,89"), 1_234_568);
    }

    #[test]
    fn per_square_meter_price() {
        assert_eq!(
            parse_price("50 triệu/m²").unwrap(),
            ParsedPrice::PerSqm(50_000_000)
        );
        assert_eq!(
            ParsedPrice::PerSqm(50_000_000).resolve(85.0),
            Some(4_250_000_000)
        );
    }

    #[test]
    fn undisclosed_and_garbage_prices() {
        assert_eq!(parse_price("Thỏa thuận"), Err(NormalizeError::Missing("price")));
        assert_eq!(parse_price("   "), Err(NormalizeError::Missing("price")));
        assert!(matches!(
            parse_price("giá tốt"),
            Err(NormalizeError::Unparseable { field: "price", .. })
        ));
    }

    #[test]
    fn oversized_prices_are_unparseable() {
        let huge = "100000000000000000000000000000000000000";
        assert!(matches!(
            parse_price(huge),
            Err(NormalizeError::Unparseable { field: "price", .. })
        ));
        assert!(matches!(
            parse_price("99999999999999999999999999999 tỷ"),
            Err(NormalizeError::Unparseable { field: "price", .. })
        ));

        let mut f = fields();
        f.price_text = Some(huge.into());
        let err = normalize("s", &f, Utc::now()).unwrap_err();
        assert!(!err.is_validation());
    }

    #[test]
    fn area_text() {
        assert_eq!(parse_area("85m²").unwrap(), 85.0);
        assert_eq!(parse_area("85,5 m2").unwrap(), 85.5);
        assert_eq!(parse_area("1.200 sqm").unwrap(), 1200.0);
        assert_eq!(parse_area("80 - 100 m²").unwrap(), 80.0);
        assert_eq!(parse_area("0,5 ha").unwrap(), 5000.0);
        assert!(parse_area("0 m²").is_err());
        assert!(parse_area("n/a").is_err());
    }

    #[test]
    fn every_label_in_table_maps_to_its_type() {
        for (label, expected) in PROPERTY_TYPE_LABELS {
            assert_eq!(
                property_type_from_label(label),
                *expected,
                "label {:?}",
                label
            );
        }
    }

    #[test]
    fn label_precedence_and_fallback() {
        assert_eq!(property_type_from_label("Nhà phố thương mại"), PropertyType::Townhouse);
        assert_eq!(property_type_from_label("Bán nhà riêng"), PropertyType::House);
        assert_eq!(property_type_from_label("Townhouse"), PropertyType::Townhouse);
        assert_eq!(property_type_from_label("Đất nền dự án"), PropertyType::Land);
        assert_eq!(property_type_from_label("Mua bán nhà đất"), PropertyType::Other);
        assert_eq!(property_type_from_label("Kho, nhà xưởng"), PropertyType::Other);
        assert_eq!(property_type_from_label("apartment"), PropertyType::Apartment);
        assert_eq!(property_type_from_label("Văn phòng"), PropertyType::Other);
        assert_eq!(property_type_from_label(""), PropertyType::Other);
    }

    #[test]
    fn external_ids_from_urls() {
        assert_eq!(
            external_id_from_url("https://chotot.com/mua-ban-can-ho/112345678.htm").as_deref(),
            Some("112345678")
        );
        assert_eq!(
            external_id_from_url(
                "https://batdongsan.com.vn/ban-can-ho-quan-2/can-ho-view-song-pr38765432?utm=x"
            )
            .as_deref(),
            Some("38765432")
        );
        assert_eq!(external_id_from_url("https://example.com/listing/abc"), None);
        assert_eq!(external_id_from_url("https://example.com/p/12"), None);
    }

    #[test]
    fn normalize_full_record() {
        let now = Utc::now();
        let rec = normalize("chotot", &fields(), now).unwrap();
        assert_eq!(rec.title, "Căn hộ cao cấp tại Quận 2");
        assert_eq!(rec.location_text, "Quận 2, TP.HCM");
        assert_eq!(rec.price_minor, 3_200_000_000);
        assert_eq!(rec.area_sqm, 85.0);
        assert_eq!(rec.property_type, PropertyType::Apartment);
        assert_eq!(rec.bedrooms, Some(3));
        assert_eq!(rec.bathrooms, Some(2));
        assert_eq!(rec.external_id.as_deref(), Some("112345678"));
        assert_eq!(rec.first_seen_at, now);
        assert_eq!(rec.content_hash.len(), 64);
    }

    #[test]
    fn explicit_external_id_wins_over_url() {
        let mut f = fields();
        f.external_id = Some(" 42 ".into());
        let rec = normalize("chotot", &f, Utc::now()).unwrap();
        assert_eq!(rec.external_id.as_deref(), Some("42"));
    }

    #[test]
    fn rejections_are_classified() {
        let mut f = fields();
        f.price_text = None;
        let err = normalize("s", &f, Utc::now()).unwrap_err();
        assert_eq!(err, NormalizeError::Missing("price"));
        assert!(err.is_validation());

        let mut f = fields();
        f.area_text = Some("   ".into());
        assert_eq!(
            normalize("s", &f, Utc::now()).unwrap_err(),
            NormalizeError::Missing("area")
        );

        let mut f = fields();
        f.area_text = Some("rộng".into());
        let err = normalize("s", &f, Utc::now()).unwrap_err();
        assert!(!err.is_validation());
    }

    #[test]
    fn content_hash_is_stable_under_whitespace_and_case() {
        let a = content_hash("Nhà  đẹp", 100, 50.0, "Quận 1");
        let b = content_hash(" Nhà đẹp ", 100, 50.0, "quận 1");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("Nhà đẹp", 101, 50.0, "Quận 1"));
    }
}
