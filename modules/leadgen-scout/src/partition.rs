use serde::{Deserialize, Serialize};

use leadgen_common::{is_valid_zip, normalize_region, parse_zip, LeadgenError};

/// One worker's share of a Stage-1 run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTask {
    pub region: String,
    pub zips: Vec<u32>,
    pub worker_index: usize,
}

/// Candidate ZIPs for `region` in `[start, end]`, ascending.
pub fn candidate_zips(region: &str, start: u32, end: u32) -> Vec<u32> {
    if start > end {
        return Vec::new();
    }
    (start..=end).filter(|z| is_valid_zip(region, *z)).collect()
}

/// An explicit ZIP list, restricted to the region and at or after `from`,
/// sorted and deduplicated.
pub fn filter_candidates(region: &str, zips: &[u32], from: u32) -> Vec<u32> {
    let mut out: Vec<u32> = zips
        .iter()
        .copied()
        .filter(|z| *z >= from && is_valid_zip(region, *z))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Parse an explicit ZIP list given as a JSON array (`[30301, "30302"]`) or
/// comma-separated text (`30301,30302`).
pub fn parse_zip_list(raw: &str) -> Result<Vec<u32>, String> {
    let trimmed = raw.trim();
    let items: Vec<String> = if trimmed.starts_with('[') {
        let values: Vec<serde_json::Value> =
            serde_json::from_str(trimmed).map_err(|e| format!("invalid ZIP list: {e}"))?;
        values
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect()
    } else {
        trimmed
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    items
        .iter()
        .map(|item| parse_zip(item).ok_or_else(|| format!("not a ZIP code: {item:?}")))
        .collect()
}

pub struct ZipPartitioner {
    worker_count: usize,
}

impl ZipPartitioner {
    pub fn new(worker_count: usize) -> Result<Self, LeadgenError> {
        if worker_count == 0 {
            return Err(LeadgenError::Config("worker count must be at least 1".into()));
        }
        Ok(Self { worker_count })
    }

    /// Contiguous, ascending chunks of `ceil(len / workers)` ZIPs. Fewer
    /// candidates than workers gives fewer tasks; none gives no tasks.
    pub fn partition(&self, region: &str, candidates: &[u32]) -> Vec<SearchTask> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let chunk = candidates.len().div_ceil(self.worker_count);
        let region = normalize_region(region);
        candidates
            .chunks(chunk)
            .take(self.worker_count)
            .enumerate()
            .map(|(worker_index, zips)| SearchTask {
                region: region.clone(),
                zips: zips.to_vec(),
                worker_index,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_zips_two_workers() {
        let tasks = ZipPartitioner::new(2)
            .unwrap()
            .partition("GA", &[30301, 30302, 30303]);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].zips, vec![30301, 30302]);
        assert_eq!(tasks[1].zips, vec![30303]);
        assert_eq!(tasks[1].worker_index, 1);
    }

    #[test]
    fn partitions_cover_candidates_exactly() {
        let candidates = candidate_zips("GA", 29990, 32010);
        for workers in [1, 3, 7, 10, 64] {
            let tasks = ZipPartitioner::new(workers).unwrap().partition("ga", &candidates);
            assert!(tasks.len() <= workers);
            assert!(tasks.iter().all(|t| !t.zips.is_empty() && t.region == "GA"));
            let joined: Vec<u32> = tasks.into_iter().flat_map(|t| t.zips).collect();
            assert_eq!(joined, candidates);
        }
    }

    #[test]
    fn invalid_region_zips_are_dropped() {
        let candidates = candidate_zips("GA", 31998, 32001);
        assert_eq!(candidates, vec![31998, 31999]);
        assert!(candidate_zips("GA", 32000, 32100).is_empty());
        assert!(candidate_zips("GA", 30310, 30300).is_empty());
    }

    #[test]
    fn more_workers_than_zips() {
        let tasks = ZipPartitioner::new(10).unwrap().partition("GA", &[30301, 30302]);
        assert_eq!(tasks.len(), 2);
        assert!(ZipPartitioner::new(10).unwrap().partition("GA", &[]).is_empty());
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        assert!(matches!(ZipPartitioner::new(0), Err(LeadgenError::Config(_))));
    }

    #[test]
    fn zip_lists_parse_from_json_or_commas() {
        assert_eq!(parse_zip_list("[30301, \"02134\"]").unwrap(), vec![30301, 2134]);
        assert_eq!(parse_zip_list(" 30301, 30302 ,").unwrap(), vec![30301, 30302]);
        assert!(parse_zip_list("30301,abc").is_err());
        assert!(parse_zip_list("[30301").is_err());
    }

    #[test]
    fn explicit_lists_are_filtered_sorted_deduped() {
        let zips = filter_candidates("GA", &[30305, 32801, 30301, 30305, 30299], 30300);
        assert_eq!(zips, vec![30301, 30305]);
    }
}
