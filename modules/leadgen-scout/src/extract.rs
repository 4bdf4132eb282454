//! Default extractors for rendered result pages.
//!
//! Both are deliberately shallow: they slice the page into cards on a stable
//! container marker and pull fields with regexes. Anything they cannot find
//! stays `None` and becomes the `"N/A"` sentinel downstream.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use leadgen_common::{format_zip, is_present, BusinessRecord, DirectoryHit, NOT_AVAILABLE};

use crate::traits::{DirectoryExtractor, RecordExtractor};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("listing {index}: {reason}")]
    Malformed { index: usize, reason: String },
}

/// Listing fields as found on the page, before tagging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub name: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub open_status: Option<String>,
    pub website: Option<String>,
    pub reviews_link: Option<String>,
}

impl RawListing {
    /// Fill absent fields with the sentinel and tag with industry and ZIP.
    pub fn into_record(self, industry: &str, zip: u32) -> BusinessRecord {
        let or_na = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| is_present(v))
                .unwrap_or_else(|| NOT_AVAILABLE.to_string())
        };
        BusinessRecord {
            business_name: or_na(self.name),
            rating: or_na(self.rating),
            review_count: or_na(self.review_count),
            category: or_na(self.category),
            address: or_na(self.address),
            phone: or_na(self.phone),
            open_status: or_na(self.open_status),
            website: or_na(self.website),
            reviews_link: or_na(self.reviews_link),
            industry: industry.to_string(),
            location: format_zip(zip),
        }
    }
}

/// A directory result card. Promoted cards are sponsored placements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCard {
    #[serde(flatten)]
    pub hit: DirectoryHit,
    #[serde(default)]
    pub promoted: bool,
}

/// First organic card, if any. Sponsored results are never treated as matches,
/// even when they are the only result.
pub fn first_organic(cards: &[DirectoryCard]) -> Option<&DirectoryCard> {
    cards.iter().find(|c| !c.promoted)
}

// --- Text helpers ---

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

struct Text {
    tags: Regex,
    spaces: Regex,
}

impl Text {
    fn new() -> Self {
        Self {
            tags: Regex::new(r"(?s)<[^>]*>").expect("valid regex"),
            spaces: Regex::new(r"\s+").expect("valid regex"),
        }
    }

    /// Markup fragment -> trimmed plain text.
    fn plain(&self, fragment: &str) -> String {
        let stripped = self.tags.replace_all(fragment, " ");
        let decoded = decode_entities(&stripped);
        self.spaces.replace_all(decoded.trim(), " ").into_owned()
    }
}

fn attribute(attrs: &Regex, tag: &str, name: &str) -> Option<String> {
    attrs
        .captures_iter(tag)
        .find(|c| c[1].eq_ignore_ascii_case(name))
        .map(|c| decode_entities(&c[2]))
}

/// Byte offsets where each card starts; each card runs to the next start.
fn card_slices<'a>(content: &'a str, starts: &[usize]) -> Vec<&'a str> {
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(content.len());
            &content[start..end]
        })
        .collect()
}

// --- Map search feed ---

pub struct MapsFeedExtractor {
    text: Text,
    card: Regex,
    anchors: Regex,
    attrs: Regex,
    headline: Regex,
    rating: Regex,
    reviews: Regex,
    spans: Regex,
    phone: Regex,
}

impl Default for MapsFeedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MapsFeedExtractor {
    pub fn new() -> Self {
        Self {
            text: Text::new(),
            card: Regex::new(r#"role="article""#).expect("valid regex"),
            anchors: Regex::new(r#"(?s)<a\b[^>]*>"#).expect("valid regex"),
            attrs: Regex::new(r#"([a-zA-Z][\w:-]*)\s*=\s*"([^"]*)""#).expect("valid regex"),
            headline: Regex::new(r#"(?s)class="[^"]*\bfontHeadlineSmall\b[^"]*"[^>]*>(.*?)</div>"#)
                .expect("valid regex"),
            rating: Regex::new(r#"class="MW4etd"[^>]*>([^<]*)<"#).expect("valid regex"),
            reviews: Regex::new(r#"class="UY7F9"[^>]*>([^<]*)<"#).expect("valid regex"),
            spans: Regex::new(r#"(?s)<span\b[^>]*>([^<]*)</span>"#).expect("valid regex"),
            phone: Regex::new(r"\(\d{3}\)\s?\d{3}-\d{4}").expect("valid regex"),
        }
    }

    fn listing(&self, index: usize, card: &str) -> Result<RawListing, ExtractError> {
        let mut listing = RawListing::default();

        for anchor in self.anchors.find_iter(card).map(|m| m.as_str()) {
            let class = attribute(&self.attrs, anchor, "class").unwrap_or_default();
            if class.split_whitespace().any(|c| c == "hfpxzc") {
                listing.reviews_link = attribute(&self.attrs, anchor, "href");
                if listing.name.is_none() {
                    listing.name = attribute(&self.attrs, anchor, "aria-label");
                }
            } else if attribute(&self.attrs, anchor, "data-value").as_deref() == Some("Website") {
                listing.website = attribute(&self.attrs, anchor, "href");
            }
        }

        if let Some(caps) = self.headline.captures(card) {
            let name = self.text.plain(&caps[1]);
            if name.is_empty() {
                return Err(ExtractError::Malformed {
                    index,
                    reason: "empty business name".to_string(),
                });
            }
            listing.name = Some(name);
        }

        listing.rating = self.rating.captures(card).map(|c| self.text.plain(&c[1]));
        listing.review_count = self.reviews.captures(card).map(|c| self.text.plain(&c[1]));

        // The info block is a run of short spans separated by "·": category
        // first, then the street address, then phone and opening hours.
        let mut rest = Vec::new();
        for caps in self.spans.captures_iter(card) {
            let part = self.text.plain(&caps[1]);
            if part.is_empty() || part == "·" {
                continue;
            }
            if listing.rating.as_deref() == Some(part.as_str())
                || listing.review_count.as_deref() == Some(part.as_str())
            {
                continue;
            }
            if self.phone.is_match(&part) {
                listing.phone.get_or_insert(part);
            } else if ["Open", "Closed", "Closes", "Opens"]
                .iter()
                .any(|p| part.starts_with(p))
            {
                listing.open_status.get_or_insert(part);
            } else {
                rest.push(part);
            }
        }
        let mut rest = rest.into_iter().filter(|p| !p.starts_with('$'));
        listing.category = rest.next();
        listing.address = rest.find(|p| p.chars().any(|c| c.is_ascii_digit()));

        Ok(listing)
    }
}

impl RecordExtractor for MapsFeedExtractor {
    fn extract(&self, content: &str) -> Vec<Result<RawListing, ExtractError>> {
        let starts: Vec<usize> = self.card.find_iter(content).map(|m| m.start()).collect();
        card_slices(content, &starts)
            .into_iter()
            .enumerate()
            .map(|(i, card)| self.listing(i + 1, card))
            .collect()
    }
}

// --- Directory search results ---

pub struct DirectoryCardExtractor {
    base: Option<Url>,
    text: Text,
    divs: Regex,
    attrs: Regex,
    name_link: Regex,
    tel: Regex,
    address: Regex,
}

impl DirectoryCardExtractor {
    /// `base_url` resolves relative profile links.
    pub fn new(base_url: &str) -> Self {
        Self {
            base: Url::parse(base_url).ok(),
            text: Text::new(),
            divs: Regex::new(r#"<div\b[^>]*\bclass="([^"]*)"[^>]*>"#).expect("valid regex"),
            attrs: Regex::new(r#"([a-zA-Z][\w:-]*)\s*=\s*"([^"]*)""#).expect("valid regex"),
            name_link: Regex::new(r#"(?s)result-business-name.*?(<a\b[^>]*>)(.*?)</a>"#)
                .expect("valid regex"),
            tel: Regex::new(r#"(?s)<a\b[^>]*href="tel:[^"]*"[^>]*>(.*?)</a>"#).expect("valid regex"),
            address: Regex::new(r#"(?s)<p\b[^>]*class="[^"]*\btext-gray-70\b[^"]*"[^>]*>(.*?)</p>"#)
                .expect("valid regex"),
        }
    }

    fn resolve(&self, href: &str) -> Option<String> {
        if href.starts_with("http://") || href.starts_with("https://") {
            return Some(href.to_string());
        }
        self.base.as_ref()?.join(href).ok().map(|u| u.to_string())
    }

    fn card(&self, chunk: &str, promoted: bool) -> Option<DirectoryCard> {
        let caps = self.name_link.captures(chunk)?;
        let href = attribute(&self.attrs, &caps[1], "href")?;
        let url = self.resolve(href.trim())?;
        let name = self.text.plain(&caps[2]);
        if name.is_empty() {
            return None;
        }

        let phone = self
            .tel
            .captures(chunk)
            .map(|c| self.text.plain(&c[1]))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let address = self
            .address
            .captures(chunk)
            .map(|c| self.text.plain(&c[1]))
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        Some(DirectoryCard {
            hit: DirectoryHit {
                name,
                url,
                phone,
                address,
            },
            promoted,
        })
    }
}

impl DirectoryExtractor for DirectoryCardExtractor {
    fn cards(&self, content: &str) -> Vec<DirectoryCard> {
        let mut starts = Vec::new();
        let mut promoted = Vec::new();
        for caps in self.divs.captures_iter(content) {
            let classes: Vec<&str> = caps[1].split_whitespace().collect();
            let is_ad = classes.contains(&"ad-slot");
            if is_ad || classes.contains(&"result-card") {
                starts.push(caps.get(0).map(|m| m.start()).unwrap_or(0));
                promoted.push(is_ad);
            }
        }

        card_slices(content, &starts)
            .into_iter()
            .zip(promoted)
            .filter_map(|(chunk, is_ad)| self.card(chunk, is_ad))
            .collect()
    }
}
