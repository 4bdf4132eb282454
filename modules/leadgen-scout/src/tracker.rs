use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::info;

use leadgen_common::{normalize_region, region_name, LeadgenError, TrackerEntry, ZipMark};

use crate::dataset;

/// Where a run should start given the tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePlan {
    /// No watermark (or bypass): start where requested.
    Fresh { start: u32 },
    /// Continue after the watermark.
    Resume { start: u32, previous: u32 },
    /// Everything up to the requested end is already scraped.
    Complete { previous: u32 },
}

impl ResumePlan {
    pub fn start(&self) -> Option<u32> {
        match self {
            ResumePlan::Fresh { start } | ResumePlan::Resume { start, .. } => Some(*start),
            ResumePlan::Complete { .. } => None,
        }
    }

    pub fn previous(&self) -> Option<u32> {
        match self {
            ResumePlan::Fresh { .. } => None,
            ResumePlan::Resume { previous, .. } | ResumePlan::Complete { previous } => Some(*previous),
        }
    }
}

/// Highest candidate `w` such that every candidate `<= w` was processed.
/// `candidates` must be ascending.
pub fn processed_prefix(candidates: &[u32], processed: &HashSet<u32>) -> Option<u32> {
    candidates
        .iter()
        .take_while(|z| processed.contains(z))
        .last()
        .copied()
}

/// Per-region scrape watermarks, persisted as a JSON list.
pub struct ProgressTrackerStore {
    path: PathBuf,
    entries: Vec<TrackerEntry>,
}

impl ProgressTrackerStore {
    pub fn load(path: &Path) -> Result<Self, LeadgenError> {
        Ok(Self {
            path: path.to_path_buf(),
            entries: dataset::load_list(path)?,
        })
    }

    pub fn entry(&self, region: &str) -> Option<&TrackerEntry> {
        let code = normalize_region(region);
        self.entries
            .iter()
            .find(|e| normalize_region(&e.abbreviation) == code)
    }

    pub fn watermark(&self, region: &str) -> Option<u32> {
        self.entry(region).and_then(|e| e.last_zip_scraped.zip())
    }

    /// Effective start is `max(start, watermark + 1)`.
    pub fn resume(&self, region: &str, start: u32, end: u32) -> ResumePlan {
        let Some(previous) = self.watermark(region) else {
            info!(region, start, "No previous progress, starting at requested ZIP");
            return ResumePlan::Fresh { start };
        };

        let next = previous.saturating_add(1).max(start);
        if next > end {
            info!(region, last_scraped = previous, end, "Requested range already scraped");
            ResumePlan::Complete { previous }
        } else {
            info!(region, last_scraped = previous, start = next, "Resuming after last scraped ZIP");
            ResumePlan::Resume { start: next, previous }
        }
    }

    /// Raise the watermark to `watermark` if it moves forward. Creates the
    /// region's entry on first use. Returns whether anything changed.
    pub fn advance(&mut self, region: &str, effective_start: u32, watermark: u32) -> bool {
        let code = normalize_region(region);
        let idx = match self
            .entries
            .iter()
            .position(|e| normalize_region(&e.abbreviation) == code)
        {
            Some(idx) => idx,
            None => {
                self.entries.push(TrackerEntry {
                    abbreviation: code.clone(),
                    name: region_name(&code),
                    first_zip_scraped: ZipMark::NotScraped,
                    last_zip_scraped: ZipMark::NotScraped,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[idx];
        if entry
            .last_zip_scraped
            .zip()
            .is_some_and(|previous| watermark <= previous)
        {
            return false;
        }
        if entry.first_zip_scraped == ZipMark::NotScraped {
            entry.first_zip_scraped = ZipMark::Zip(effective_start);
        }
        entry.last_zip_scraped = ZipMark::Zip(watermark);
        info!(region = code.as_str(), watermark, "Tracker advanced");
        true
    }

    pub fn save(&self) -> Result<(), LeadgenError> {
        dataset::save_list(&self.path, &self.entries)
    }
}
