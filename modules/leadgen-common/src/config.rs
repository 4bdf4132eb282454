use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LeadgenError;

pub const DEFAULT_MAP_SEARCH_URL: &str = "https://www.google.com/maps/search/{query}";
pub const DEFAULT_DIRECTORY_SEARCH_URL: &str = "https://www.bbb.org/search";

/// Inclusive bounds for a randomized pause, parsed from `"MIN-MAX"` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const NONE: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min.min(max)),
            max: Duration::from_millis(min.max(max)),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }
}

impl FromStr for DelayRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| format!("expected milliseconds, got {part:?}"))
        };
        match s.split_once('-') {
            Some((lo, hi)) => Ok(Self::from_millis(parse(lo)?, parse(hi)?)),
            None => {
                let fixed = parse(s)?;
                Ok(Self::from_millis(fixed, fixed))
            }
        }
    }
}

/// Where browser sessions come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserBackend {
    /// Local headless Chromium, one `--dump-dom` process per page load.
    Chrome { bin: String },
    /// Remote Browserless instance.
    Browserless { url: String, token: Option<String> },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,

    // Worker pools
    pub workers: usize,
    pub match_workers: usize,

    // Search
    pub industry: String,
    pub map_search_url: String,
    pub directory_search_url: String,
    pub browser: BrowserBackend,

    // Per-ZIP scroll loop bounds
    pub max_listings: usize,
    pub scroll_budget: Duration,
    pub max_stalled_scrolls: u32,
    pub page_load_timeout: Duration,

    // Pacing
    pub zip_delay: DelayRange,
    pub match_delay: DelayRange,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, LeadgenError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup. Every variable has a default;
    /// only unparsable values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LeadgenError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let browser = match get("BROWSERLESS_URL") {
            Some(url) => BrowserBackend::Browserless {
                url,
                token: get("BROWSERLESS_TOKEN"),
            },
            None => BrowserBackend::Chrome {
                bin: get("CHROME_BIN").unwrap_or_else(|| "chromium".to_string()),
            },
        };

        let config = Self {
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            workers: parse_or(&get, "LEADGEN_WORKERS", 10)?,
            match_workers: parse_or(&get, "LEADGEN_MATCH_WORKERS", 10)?,
            industry: get("LEADGEN_INDUSTRY").unwrap_or_else(|| "Roofing".to_string()),
            map_search_url: get("LEADGEN_MAP_SEARCH_URL")
                .unwrap_or_else(|| DEFAULT_MAP_SEARCH_URL.to_string()),
            directory_search_url: get("LEADGEN_DIRECTORY_SEARCH_URL")
                .unwrap_or_else(|| DEFAULT_DIRECTORY_SEARCH_URL.to_string()),
            browser,
            max_listings: parse_or(&get, "LEADGEN_MAX_LISTINGS", 100)?,
            scroll_budget: Duration::from_secs(parse_or(&get, "LEADGEN_SCROLL_BUDGET_SECS", 180)?),
            max_stalled_scrolls: parse_or(&get, "LEADGEN_MAX_STALLED_SCROLLS", 3)?,
            page_load_timeout: Duration::from_secs(parse_or(
                &get,
                "LEADGEN_PAGE_LOAD_TIMEOUT_SECS",
                10,
            )?),
            zip_delay: parse_or(&get, "LEADGEN_ZIP_DELAY_MS", DelayRange::from_millis(2000, 5000))?,
            match_delay: parse_or(
                &get,
                "LEADGEN_MATCH_DELAY_MS",
                DelayRange::from_millis(1500, 3500),
            )?,
        };

        if config.workers == 0 || config.match_workers == 0 {
            return Err(LeadgenError::Config(
                "worker counts must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn paths(&self) -> LeadPaths {
        LeadPaths::new(&self.data_dir)
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        let browser = match &self.browser {
            BrowserBackend::Chrome { bin } => format!("chrome ({bin})"),
            BrowserBackend::Browserless { url, token } => format!(
                "browserless ({url}, token={})",
                if token.is_some() { "***" } else { "none" }
            ),
        };
        info!(
            data_dir = %self.data_dir.display(),
            workers = self.workers,
            match_workers = self.match_workers,
            industry = self.industry.as_str(),
            browser = browser.as_str(),
            max_listings = self.max_listings,
            scroll_budget_secs = self.scroll_budget.as_secs(),
            page_load_timeout_secs = self.page_load_timeout.as_secs(),
            "Config loaded"
        );
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, LeadgenError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| LeadgenError::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// On-disk layout of every dataset the pipeline reads or writes.
#[derive(Debug, Clone)]
pub struct LeadPaths {
    pub raw_dir: PathBuf,
    pub final_dir: PathBuf,
    pub by_zip_dir: PathBuf,
    pub search_results: PathBuf,
    pub search_filtered: PathBuf,
    pub directory_parts_dir: PathBuf,
    pub directory_matches: PathBuf,
    pub final_leads: PathBuf,
    pub tracker: PathBuf,
    pub runs_dir: PathBuf,
}

impl LeadPaths {
    pub fn new(data_dir: &Path) -> Self {
        let leads = data_dir.join("leads");
        let raw_dir = leads.join("raw");
        let final_dir = leads.join("final");
        Self {
            by_zip_dir: raw_dir.join("by_zip"),
            search_results: raw_dir.join("search_results.json"),
            search_filtered: raw_dir.join("search_filtered.json"),
            directory_parts_dir: raw_dir.join("directory_parts"),
            directory_matches: raw_dir.join("directory_matches.json"),
            final_leads: final_dir.join("final_leads.json"),
            tracker: final_dir.join("zip_tracker.json"),
            runs_dir: leads.join("runs"),
            raw_dir,
            final_dir,
        }
    }

    /// Worker reports for one run.
    pub fn reports_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.workers, 10);
        assert_eq!(config.industry, "Roofing");
        assert_eq!(config.max_listings, 100);
        assert_eq!(config.scroll_budget, Duration::from_secs(180));
        assert_eq!(config.zip_delay, DelayRange::from_millis(2000, 5000));
        assert_eq!(
            config.browser,
            BrowserBackend::Chrome {
                bin: "chromium".into()
            }
        );
    }

    #[test]
    fn browserless_takes_precedence_over_chrome() {
        let config = Config::from_lookup(lookup(&[
            ("BROWSERLESS_URL", "http://browserless:3000"),
            ("BROWSERLESS_TOKEN", "secret"),
            ("CHROME_BIN", "/usr/bin/chromium"),
        ]))
        .unwrap();
        assert_eq!(
            config.browser,
            BrowserBackend::Browserless {
                url: "http://browserless:3000".into(),
                token: Some("secret".into()),
            }
        );
    }

    #[test]
    fn unparsable_values_are_errors() {
        let err = Config::from_lookup(lookup(&[("LEADGEN_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("LEADGEN_WORKERS"));

        let err = Config::from_lookup(lookup(&[("LEADGEN_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, LeadgenError::Config(_)));
    }

    #[test]
    fn delay_ranges_parse_single_and_pair() {
        assert_eq!("250".parse::<DelayRange>().unwrap(), DelayRange::from_millis(250, 250));
        assert_eq!(
            "5000-2000".parse::<DelayRange>().unwrap(),
            DelayRange::from_millis(2000, 5000)
        );
        assert!("soon".parse::<DelayRange>().is_err());
        assert!(DelayRange::NONE.is_zero());
    }

    #[test]
    fn paths_hang_off_data_dir() {
        let paths = LeadPaths::new(Path::new("/tmp/d"));
        assert_eq!(paths.by_zip_dir, PathBuf::from("/tmp/d/leads/raw/by_zip"));
        assert_eq!(paths.tracker, PathBuf::from("/tmp/d/leads/final/zip_tracker.json"));
        assert_eq!(paths.reports_dir("r1"), PathBuf::from("/tmp/d/leads/runs/r1"));
    }
}
