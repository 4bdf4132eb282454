use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use leadgen_common::{BusinessRecord, DirectoryMatchRecord, LeadgenError};

use crate::dataset;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub existing: usize,
    pub scanned: usize,
    pub added: usize,
    pub total: usize,
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} existing, {} scanned, {} added, {} total",
            self.existing, self.scanned, self.added, self.total
        )
    }
}

/// First-seen-wins merge. `existing` goes first, then each partition in the
/// order given. Records whose key is `None` carry no identity and are dropped.
pub fn merge_by<T, K, F>(existing: Vec<T>, partitions: Vec<Vec<T>>, key: F) -> (Vec<T>, MergeReport)
where
    K: Eq + Hash,
    F: Fn(&T) -> Option<K>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(existing.len());
    let mut report = MergeReport::default();

    for record in existing {
        if let Some(k) = key(&record) {
            if seen.insert(k) {
                merged.push(record);
            }
        }
    }
    report.existing = merged.len();

    for record in partitions.into_iter().flatten() {
        report.scanned += 1;
        if let Some(k) = key(&record) {
            if seen.insert(k) {
                merged.push(record);
                report.added += 1;
            }
        }
    }
    report.total = merged.len();
    (merged, report)
}

/// Stage-1 and raw Stage-2 identity.
pub fn business_key(record: &BusinessRecord) -> Option<(String, String)> {
    record.has_name().then(|| {
        let (name, location) = record.identity();
        (name.to_string(), location.to_string())
    })
}

pub fn match_key(record: &DirectoryMatchRecord) -> Option<(String, String)> {
    business_key(&record.business)
}

/// Final-lead identity: only a real directory URL counts.
pub fn directory_url_key(record: &DirectoryMatchRecord) -> Option<String> {
    record.is_matched().then(|| record.directory_url.clone())
}

/// Merge every partition file under `parts_dir` into the canonical file and
/// rewrite it. Unreadable partitions are skipped with a warning; an
/// unreadable canonical file is an error so it is never overwritten.
pub fn merge_partition_dir<T, K, F>(
    canonical: &Path,
    parts_dir: &Path,
    key: F,
) -> Result<MergeReport, LeadgenError>
where
    T: Serialize + DeserializeOwned,
    K: Eq + Hash,
    F: Fn(&T) -> Option<K>,
{
    let existing: Vec<T> = dataset::load_list_lenient(canonical)?;

    let mut partitions = Vec::new();
    for file in dataset::partition_files(parts_dir)? {
        match dataset::load_list_lenient::<T>(&file) {
            Ok(records) => partitions.push(records),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping unreadable partition"),
        }
    }

    let (merged, report) = merge_by(existing, partitions, key);
    dataset::save_list(canonical, &merged)?;
    info!(path = %canonical.display(), %report, "Merged partitions");
    Ok(report)
}

/// Stage-1 filter: named businesses without a website are the leads worth matching.
pub fn named_without_website(records: &[BusinessRecord]) -> Vec<BusinessRecord> {
    records
        .iter()
        .filter(|r| r.has_name() && !r.has_website())
        .cloned()
        .collect()
}

/// Final filter: matched records, deduplicated by directory URL, existing leads first.
pub fn final_leads(
    existing: Vec<DirectoryMatchRecord>,
    matches: Vec<DirectoryMatchRecord>,
) -> (Vec<DirectoryMatchRecord>, MergeReport) {
    merge_by(existing, vec![matches], directory_url_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgen_common::NOT_AVAILABLE;

    fn record(name: &str, zip: &str) -> BusinessRecord {
        BusinessRecord {
            business_name: name.into(),
            location: zip.into(),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_across_workers_collapses() {
        let worker_a = vec![record("Acme Roofing", "30301"), record("Acme Roofing", "30301")];
        let worker_b = vec![record("Acme Roofing", "30301"), record("Summit Roofs", "30301")];
        let (merged, report) = merge_by(Vec::new(), vec![worker_a, worker_b], business_key);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].business_name, "Acme Roofing");
        assert_eq!(report.scanned, 4);
        assert_eq!(report.added, 2);
    }

    #[test]
    fn same_name_in_other_zip_is_distinct() {
        let (merged, _) = merge_by(
            vec![record("Acme Roofing", "30301")],
            vec![vec![record("Acme Roofing", "30302")]],
            business_key,
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn padded_name_is_the_same_business() {
        let (merged, _) = merge_by(
            vec![record("Acme Roofing", "30301")],
            vec![vec![record(" Acme Roofing ", "30301")]],
            business_key,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(
            business_key(&record(" Acme Roofing", "30301")),
            Some(("Acme Roofing".to_string(), "30301".to_string()))
        );
    }

    #[test]
    fn existing_wins_over_partitions() {
        let mut newer = record("Acme Roofing", "30301");
        newer.phone = "(404) 555-0199".into();
        let (merged, report) = merge_by(
            vec![record("Acme Roofing", "30301")],
            vec![vec![newer]],
            business_key,
        );
        assert_eq!(merged[0].phone, NOT_AVAILABLE);
        assert_eq!(report.existing, 1);
        assert_eq!(report.added, 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let parts = vec![vec![record("A", "1"), record("B", "1")], vec![record("C", "2")]];
        let (once, _) = merge_by(Vec::new(), parts.clone(), business_key);
        let (twice, report) = merge_by(once.clone(), parts, business_key);
        assert_eq!(once, twice);
        assert_eq!(report.added, 0);
    }

    #[test]
    fn unnamed_records_are_dropped() {
        let (merged, _) = merge_by(Vec::new(), vec![vec![record(NOT_AVAILABLE, "30301")]], business_key);
        assert!(merged.is_empty());
    }

    #[test]
    fn partition_dir_merge_tolerates_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let parts = dir.path().join("by_zip");
        std::fs::create_dir_all(&parts).unwrap();
        dataset::save_list(&parts.join("30301.json"), &[record("Acme Roofing", "30301")]).unwrap();
        std::fs::write(parts.join("30302.json"), "{not json").unwrap();
        dataset::save_list(&parts.join("30303.json"), &[record("Summit Roofs", "30303")]).unwrap();

        let canonical = dir.path().join("search_results.json");
        let report = merge_partition_dir::<BusinessRecord, _, _>(&canonical, &parts, business_key).unwrap();
        assert_eq!(report.total, 2);

        let again = merge_partition_dir::<BusinessRecord, _, _>(&canonical, &parts, business_key).unwrap();
        assert_eq!(again.existing, 2);
        assert_eq!(again.added, 0);
    }

    #[test]
    fn filter_keeps_named_records_without_website() {
        let mut with_site = record("Summit Roofs", "30301");
        with_site.website = "https://summit.example".into();
        let records = vec![record("Acme Roofing", "30301"), with_site, record(NOT_AVAILABLE, "30301")];
        let filtered = named_without_website(&records);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].business_name, "Acme Roofing");
    }

    #[test]
    fn final_leads_require_directory_url() {
        let mut matched = DirectoryMatchRecord::unmatched(record("Acme Roofing", "30301"));
        matched.directory_url = "https://d/acme".into();
        let mut dup = DirectoryMatchRecord::unmatched(record("Acme Roofing LLC", "30302"));
        dup.directory_url = "https://d/acme".into();
        let unmatched = DirectoryMatchRecord::unmatched(record("Summit Roofs", "30301"));

        let (leads, _) = final_leads(Vec::new(), vec![matched, dup, unmatched]);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].business.business_name, "Acme Roofing");
    }
}
