use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Placeholder for a field that is intentionally absent.
pub const NOT_AVAILABLE: &str = "N/A";

/// Joins multiple directory hits into one field.
pub const HIT_SEPARATOR: &str = "; ";

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// True when a field holds real data rather than the sentinel or nothing.
pub fn is_present(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && trimmed != NOT_AVAILABLE
}

/// ZIP codes are stored and displayed as five-digit strings.
pub fn format_zip(zip: u32) -> String {
    format!("{zip:05}")
}

pub fn parse_zip(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok().filter(|z| *z <= 99_999)
}

// --- Stage 1 ---

/// One business discovered on the map-search provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusinessRecord {
    #[serde(default = "not_available")]
    pub business_name: String,
    #[serde(default = "not_available")]
    pub rating: String,
    #[serde(default = "not_available", alias = "NumberOfReviews")]
    pub review_count: String,
    #[serde(default = "not_available")]
    pub category: String,
    #[serde(default = "not_available")]
    pub address: String,
    #[serde(default = "not_available")]
    pub phone: String,
    #[serde(default = "not_available", alias = "Close")]
    pub open_status: String,
    #[serde(default = "not_available")]
    pub website: String,
    #[serde(default = "not_available", alias = "GoogleReviewsLink")]
    pub reviews_link: String,
    #[serde(default = "not_available")]
    pub industry: String,
    #[serde(default = "not_available")]
    pub location: String,
}

impl Default for BusinessRecord {
    fn default() -> Self {
        Self {
            business_name: not_available(),
            rating: not_available(),
            review_count: not_available(),
            category: not_available(),
            address: not_available(),
            phone: not_available(),
            open_status: not_available(),
            website: not_available(),
            reviews_link: not_available(),
            industry: not_available(),
            location: not_available(),
        }
    }
}

impl BusinessRecord {
    pub fn has_name(&self) -> bool {
        is_present(&self.business_name)
    }

    pub fn has_website(&self) -> bool {
        is_present(&self.website)
    }

    /// Stage-1 identity: the same name in the same ZIP is the same business.
    /// Surrounding whitespace in the name is not significant.
    pub fn identity(&self) -> (&str, &str) {
        (self.business_name.trim(), self.location.trim())
    }
}

// --- Stage 2 ---

/// One directory listing pulled from a result card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryHit {
    pub name: String,
    pub url: String,
    pub phone: String,
    pub address: String,
}

/// A Stage-1 survivor annotated with the outcome of its directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMatchRecord {
    #[serde(flatten)]
    pub business: BusinessRecord,
    #[serde(rename = "DirectoryName", alias = "BBB_bus", default = "not_available")]
    pub directory_name: String,
    #[serde(rename = "DirectoryUrl", alias = "BBB_url", default = "not_available")]
    pub directory_url: String,
    #[serde(rename = "DirectoryPhone", alias = "BBB_phone", default = "not_available")]
    pub directory_phone: String,
    #[serde(rename = "DirectoryAddress", alias = "BBB_address", default = "not_available")]
    pub directory_address: String,
}

impl DirectoryMatchRecord {
    pub fn unmatched(business: BusinessRecord) -> Self {
        Self {
            business,
            directory_name: not_available(),
            directory_url: not_available(),
            directory_phone: not_available(),
            directory_address: not_available(),
        }
    }

    /// Fold hits into single fields. No hits is the same as no match.
    pub fn from_hits(business: BusinessRecord, hits: &[DirectoryHit]) -> Self {
        if hits.is_empty() {
            return Self::unmatched(business);
        }
        Self {
            directory_name: join_hits(hits, |h| &h.name),
            directory_url: join_hits(hits, |h| &h.url),
            directory_phone: join_hits(hits, |h| &h.phone),
            directory_address: join_hits(hits, |h| &h.address),
            business,
        }
    }

    pub fn is_matched(&self) -> bool {
        is_present(&self.directory_url)
    }
}

fn join_hits(hits: &[DirectoryHit], field: impl Fn(&DirectoryHit) -> &str) -> String {
    hits.iter().map(field).collect::<Vec<_>>().join(HIT_SEPARATOR)
}

// --- Progress tracking ---

/// A ZIP watermark as persisted in the tracker file: either the `"N/A"`
/// sentinel or a ZIP code (written as an integer, read from integer or string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZipMark {
    #[default]
    NotScraped,
    Zip(u32),
}

impl ZipMark {
    pub fn zip(self) -> Option<u32> {
        match self {
            ZipMark::NotScraped => None,
            ZipMark::Zip(z) => Some(z),
        }
    }
}

impl fmt::Display for ZipMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZipMark::NotScraped => write!(f, "{NOT_AVAILABLE}"),
            ZipMark::Zip(z) => write!(f, "{}", format_zip(*z)),
        }
    }
}

impl Serialize for ZipMark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ZipMark::NotScraped => serializer.serialize_str(NOT_AVAILABLE),
            ZipMark::Zip(z) => serializer.serialize_u32(*z),
        }
    }
}

impl<'de> Deserialize<'de> for ZipMark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
            Null(()),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => u32::try_from(n)
                .ok()
                .filter(|z| *z <= 99_999)
                .map(ZipMark::Zip)
                .ok_or_else(|| serde::de::Error::custom(format!("ZIP out of range: {n}"))),
            Raw::Text(s) if !is_present(&s) => Ok(ZipMark::NotScraped),
            Raw::Text(s) => parse_zip(&s)
                .map(ZipMark::Zip)
                .ok_or_else(|| serde::de::Error::custom(format!("not a ZIP code: {s:?}"))),
            Raw::Null(()) => Ok(ZipMark::NotScraped),
        }
    }
}

/// One region's row in the progress tracker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub abbreviation: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub first_zip_scraped: ZipMark,
    #[serde(default)]
    pub last_zip_scraped: ZipMark,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> BusinessRecord {
        BusinessRecord {
            business_name: "Acme Roofing".into(),
            location: "30301".into(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_fields_default_to_sentinel() {
        let record: BusinessRecord =
            serde_json::from_str(r#"{"BusinessName": "Acme Roofing"}"#).unwrap();
        assert_eq!(record.business_name, "Acme Roofing");
        assert_eq!(record.website, NOT_AVAILABLE);
        assert!(!record.has_website());
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let record: DirectoryMatchRecord = serde_json::from_str(
            r#"{
                "BusinessName": "Acme Roofing",
                "NumberOfReviews": "(12)",
                "Close": "Open 24 hours",
                "GoogleReviewsLink": "https://maps.example/acme",
                "Location": "30301",
                "BBB_url": "https://directory.example/acme"
            }"#,
        )
        .unwrap();
        assert_eq!(record.business.review_count, "(12)");
        assert_eq!(record.business.open_status, "Open 24 hours");
        assert_eq!(record.business.reviews_link, "https://maps.example/acme");
        assert_eq!(record.directory_url, "https://directory.example/acme");
        assert!(record.is_matched());
    }

    #[test]
    fn directory_fields_serialize_flat() {
        let record = DirectoryMatchRecord::unmatched(acme());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["BusinessName"], "Acme Roofing");
        assert_eq!(json["DirectoryUrl"], NOT_AVAILABLE);
        assert!(!record.is_matched());
    }

    #[test]
    fn hits_are_joined() {
        let hits = vec![
            DirectoryHit {
                name: "Acme".into(),
                url: "https://d/1".into(),
                phone: "1".into(),
                address: "A".into(),
            },
            DirectoryHit {
                name: "Acme II".into(),
                url: "https://d/2".into(),
                phone: "2".into(),
                address: "B".into(),
            },
        ];
        let record = DirectoryMatchRecord::from_hits(acme(), &hits);
        assert_eq!(record.directory_url, "https://d/1; https://d/2");
        assert_eq!(record.directory_name, "Acme; Acme II");

        let empty = DirectoryMatchRecord::from_hits(acme(), &[]);
        assert!(!empty.is_matched());
    }

    #[test]
    fn zip_mark_reads_every_persisted_shape() {
        let entries: Vec<TrackerEntry> = serde_json::from_str(
            r#"[
                {"abbreviation": "GA", "name": "Georgia", "first_zip_scraped": "N/A", "last_zip_scraped": "N/A"},
                {"abbreviation": "AL", "name": "Alabama", "first_zip_scraped": 35004, "last_zip_scraped": "35010"},
                {"abbreviation": "TN"}
            ]"#,
        )
        .unwrap();
        assert_eq!(entries[0].last_zip_scraped, ZipMark::NotScraped);
        assert_eq!(entries[1].first_zip_scraped, ZipMark::Zip(35004));
        assert_eq!(entries[1].last_zip_scraped, ZipMark::Zip(35010));
        assert_eq!(entries[2].last_zip_scraped, ZipMark::NotScraped);
    }

    #[test]
    fn zip_mark_writes_integers() {
        let entry = TrackerEntry {
            abbreviation: "GA".into(),
            name: "Georgia".into(),
            first_zip_scraped: ZipMark::NotScraped,
            last_zip_scraped: ZipMark::Zip(30302),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["first_zip_scraped"], "N/A");
        assert_eq!(json["last_zip_scraped"], 30302);
    }

    #[test]
    fn zips_keep_leading_zeros() {
        assert_eq!(format_zip(2134), "02134");
        assert_eq!(parse_zip("02134"), Some(2134));
        assert_eq!(parse_zip("N/A"), None);
        assert_eq!(parse_zip("123456"), None);
    }
}
