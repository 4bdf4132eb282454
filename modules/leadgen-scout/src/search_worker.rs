//! One Stage-1 worker: walks its ZIPs with a single browser session and
//! writes one output unit per ZIP.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use leadgen_common::{format_zip, BusinessRecord, Config, DelayRange, LeadgenError};

use crate::dataset;
use crate::partition::SearchTask;
use crate::traits::{BrowserSession, RecordExtractor, SessionError, SessionFactory};

/// Where a worker writes what it finds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputTarget {
    /// One `{zip}.json` per ZIP.
    ByZip { dir: PathBuf },
    /// Legacy mode: everything appended to one file.
    SingleFile { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSettings {
    pub industry: String,
    pub map_search_url: String,
    pub max_listings: usize,
    pub scroll_budget: Duration,
    pub max_stalled_scrolls: u32,
    pub zip_delay: DelayRange,
}

impl SearchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            industry: config.industry.clone(),
            map_search_url: config.map_search_url.clone(),
            max_listings: config.max_listings,
            scroll_budget: config.scroll_budget,
            max_stalled_scrolls: config.max_stalled_scrolls,
            zip_delay: config.zip_delay,
        }
    }

    pub fn query(&self, region: &str, zip: u32) -> String {
        format!("{} {}, {}", self.industry, format_zip(zip), region)
    }

    pub fn search_url(&self, region: &str, zip: u32) -> String {
        let query = self.query(region, zip);
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.map_search_url.replace("{query}", &encoded)
    }
}

/// Everything a worker process needs, passed as one JSON launch argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub run_id: String,
    pub task: SearchTask,
    pub output: OutputTarget,
    pub report_path: PathBuf,
    pub settings: SearchSettings,
}

/// Durable progress of one worker, rewritten after every ZIP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_index: usize,
    pub processed_zips: Vec<u32>,
    pub failed_zips: Vec<u32>,
    pub records_written: usize,
    pub interrupted: bool,
}

impl WorkerReport {
    pub fn new(worker_index: usize) -> Self {
        Self {
            worker_index,
            ..Default::default()
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), LeadgenError> {
        dataset::save_json(path, self)
    }

    /// `None` when the worker never got far enough to write one.
    pub fn load(path: &Path) -> Result<Option<Self>, LeadgenError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LeadgenError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| LeadgenError::Json {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Why the scroll loop for one ZIP ended.
#[derive(Debug)]
enum ScrollStop {
    EndOfList,
    Cap,
    Budget,
    Stalled,
    Cancelled,
    Error(SessionError),
}

/// Sleep a random duration within `delay`. Returns `false` if cancelled first.
pub(crate) async fn pace(delay: DelayRange, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    let ms = rand::rng().random_range(delay.min.as_millis() as u64..=delay.max.as_millis() as u64);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
    }
}

pub struct SearchWorker {
    config: WorkerConfig,
    factory: Arc<dyn SessionFactory>,
    extractor: Arc<dyn RecordExtractor>,
    cancel: CancellationToken,
}

impl SearchWorker {
    pub fn new(
        config: WorkerConfig,
        factory: Arc<dyn SessionFactory>,
        extractor: Arc<dyn RecordExtractor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            factory,
            extractor,
            cancel,
        }
    }

    /// Process every ZIP of the task. Errors are worker-fatal: the session
    /// could not be created or output could not be written.
    pub async fn run(self) -> Result<WorkerReport> {
        let worker = self.config.task.worker_index;
        let region = self.config.task.region.as_str();
        info!(
            worker,
            region,
            zips = self.config.task.zips.len(),
            run_id = self.config.run_id.as_str(),
            "Search worker starting"
        );

        let mut report = WorkerReport::new(worker);
        report.save(&self.config.report_path)?;

        let mut session = self
            .factory
            .create()
            .await
            .with_context(|| format!("worker {worker}: creating browser session"))?;
        let mut seen = self.seed_seen_names()?;
        debug!(worker, seen = seen.len(), "Seeded seen business names");

        for (i, &zip) in self.config.task.zips.iter().enumerate() {
            if i > 0 && !pace(self.config.settings.zip_delay, &self.cancel).await {
                report.interrupted = true;
                break;
            }
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            match self.scrape_zip(session.as_mut(), zip, &mut seen).await {
                Ok(records) => {
                    let written = self
                        .write_output(zip, records)
                        .with_context(|| format!("worker {worker}: writing output for {}", format_zip(zip)))?;
                    report.records_written += written;
                    info!(worker, zip = %format_zip(zip), written, "ZIP complete");
                }
                Err(e) => {
                    warn!(worker, zip = %format_zip(zip), error = %e, "ZIP failed");
                    report.failed_zips.push(zip);
                    if e.is_transient() {
                        session = self
                            .factory
                            .create()
                            .await
                            .with_context(|| format!("worker {worker}: recreating browser session"))?;
                    }
                }
            }

            report.processed_zips.push(zip);
            report.save(&self.config.report_path)?;
        }

        report.save(&self.config.report_path)?;
        info!(
            worker,
            processed = report.processed_zips.len(),
            failed = report.failed_zips.len(),
            records = report.records_written,
            interrupted = report.interrupted,
            "Search worker finished"
        );
        Ok(report)
    }

    fn seed_seen_names(&self) -> Result<HashSet<String>> {
        let files = match &self.config.output {
            OutputTarget::ByZip { dir } => dataset::partition_files(dir)?,
            OutputTarget::SingleFile { path } => vec![path.clone()],
        };
        let mut seen = HashSet::new();
        for file in files {
            match dataset::load_list_lenient::<BusinessRecord>(&file) {
                Ok(records) => seen.extend(
                    records
                        .into_iter()
                        .filter(|r| r.has_name())
                        .map(|r| r.business_name),
                ),
                Err(e) => warn!(path = %file.display(), error = %e, "Ignoring unreadable output file"),
            }
        }
        Ok(seen)
    }

    async fn scrape_zip(
        &self,
        session: &mut dyn BrowserSession,
        zip: u32,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<BusinessRecord>, SessionError> {
        let settings = &self.config.settings;
        let url = settings.search_url(&self.config.task.region, zip);
        debug!(
            worker = self.config.task.worker_index,
            session = session.name(),
            zip = %format_zip(zip),
            url,
            "Opening search"
        );

        session.open(&url).await?;

        match self.scroll_until_done(session).await {
            ScrollStop::Error(e) => debug!(error = %e, "Scroll failed, treating as end of content"),
            stop => debug!(?stop, "Scrolling stopped"),
        }

        let content = session.content().await?;
        let mut records = Vec::new();
        for result in self.extractor.extract(&content) {
            if records.len() >= settings.max_listings {
                break;
            }
            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(zip = %format_zip(zip), error = %e, "Skipping listing");
                    continue;
                }
            };
            let record = raw.into_record(&settings.industry, zip);
            if !record.has_name() || !seen.insert(record.business_name.clone()) {
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn scroll_until_done(&self, session: &mut dyn BrowserSession) -> ScrollStop {
        let settings = &self.config.settings;
        let started = Instant::now();
        let mut stalled = 0u32;
        let mut last = None;

        loop {
            if self.cancel.is_cancelled() {
                return ScrollStop::Cancelled;
            }
            if started.elapsed() >= settings.scroll_budget {
                return ScrollStop::Budget;
            }
            let probe = match session.scroll().await {
                Ok(probe) => probe,
                Err(e) => return ScrollStop::Error(e),
            };
            if probe.end_of_list {
                return ScrollStop::EndOfList;
            }
            if probe.items >= settings.max_listings {
                return ScrollStop::Cap;
            }
            if last == Some((probe.height, probe.items)) {
                stalled += 1;
                if stalled >= settings.max_stalled_scrolls {
                    return ScrollStop::Stalled;
                }
            } else {
                stalled = 0;
            }
            last = Some((probe.height, probe.items));
        }
    }

    /// Persist new records for one ZIP. Returns how many were added.
    fn write_output(&self, zip: u32, records: Vec<BusinessRecord>) -> Result<usize, LeadgenError> {
        if records.is_empty() {
            return Ok(0);
        }
        let path = match &self.config.output {
            OutputTarget::ByZip { dir } => dir.join(format!("{}.json", format_zip(zip))),
            OutputTarget::SingleFile { path } => path.clone(),
        };

        let mut existing: Vec<BusinessRecord> = dataset::load_list_lenient(&path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Replacing unreadable output file");
            Vec::new()
        });
        let mut names: HashSet<String> = existing.iter().map(|r| r.business_name.clone()).collect();
        let before = existing.len();
        existing.extend(records.into_iter().filter(|r| names.insert(r.business_name.clone())));
        let added = existing.len() - before;
        if added > 0 {
            dataset::save_list(&path, &existing)?;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{JsonListingExtractor, MockSessionFactory};
    use crate::traits::ScrollProbe;

    fn settings() -> SearchSettings {
        SearchSettings {
            industry: "Roofing".into(),
            map_search_url: "https://maps.test/search/{query}".into(),
            max_listings: 100,
            scroll_budget: Duration::from_secs(5),
            max_stalled_scrolls: 3,
            zip_delay: DelayRange::NONE,
        }
    }

    fn worker_config(dir: &Path, zips: Vec<u32>) -> WorkerConfig {
        WorkerConfig {
            run_id: "run-1".into(),
            task: SearchTask {
                region: "GA".into(),
                zips,
                worker_index: 0,
            },
            output: OutputTarget::ByZip {
                dir: dir.join("by_zip"),
            },
            report_path: dir.join("worker-00.json"),
            settings: settings(),
        }
    }

    fn page(names: &[&str]) -> String {
        let listings: Vec<serde_json::Value> = names
            .iter()
            .map(|n| serde_json::json!({ "name": n }))
            .collect();
        serde_json::to_string(&listings).unwrap()
    }

    #[test]
    fn query_and_url_are_built_from_template() {
        let s = settings();
        assert_eq!(s.query("GA", 2134), "Roofing 02134, GA");
        assert_eq!(
            s.search_url("GA", 30301),
            "https://maps.test/search/Roofing+30301%2C+GA"
        );
    }

    #[tokio::test]
    async fn writes_one_file_per_zip_and_skips_seen_names() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings();
        let factory = MockSessionFactory::new()
            .on_page(&s.search_url("GA", 30301), page(&["Acme Roofing", "N/A", "Summit Roofs"]))
            .on_page(&s.search_url("GA", 30302), page(&["Acme Roofing", "Peach Roofing"]));

        let report = SearchWorker::new(
            worker_config(dir.path(), vec![30301, 30302]),
            Arc::new(factory),
            Arc::new(JsonListingExtractor),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.processed_zips, vec![30301, 30302]);
        assert_eq!(report.records_written, 3);

        let first: Vec<BusinessRecord> = dataset::load_list(&dir.path().join("by_zip/30301.json")).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].location, "30301");
        assert_eq!(first[0].industry, "Roofing");
        let second: Vec<BusinessRecord> = dataset::load_list(&dir.path().join("by_zip/30302.json")).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].business_name, "Peach Roofing");

        let saved = WorkerReport::load(&dir.path().join("worker-00.json")).unwrap().unwrap();
        assert_eq!(saved, report);
    }

    #[tokio::test]
    async fn load_failure_aborts_only_that_zip() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings();
        let factory = Arc::new(
            MockSessionFactory::new()
                .on_error(&s.search_url("GA", 30301), SessionError::Timeout("feed".into()))
                .on_page(&s.search_url("GA", 30302), page(&["Acme Roofing"])),
        );

        let report = SearchWorker::new(
            worker_config(dir.path(), vec![30301, 30302]),
            factory.clone(),
            Arc::new(JsonListingExtractor),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.failed_zips, vec![30301]);
        assert_eq!(report.processed_zips, vec![30301, 30302]);
        assert!(!dir.path().join("by_zip/30301.json").exists());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn session_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = SearchWorker::new(
            worker_config(dir.path(), vec![30301]),
            Arc::new(MockSessionFactory::new().fail_create()),
            Arc::new(JsonListingExtractor),
            CancellationToken::new(),
        )
        .run()
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancelled_worker_stops_before_next_zip() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = SearchWorker::new(
            worker_config(dir.path(), vec![30301, 30302]),
            Arc::new(MockSessionFactory::new()),
            Arc::new(JsonListingExtractor),
            cancel,
        )
        .run()
        .await
        .unwrap();
        assert!(report.interrupted);
        assert!(report.processed_zips.is_empty());
    }

    #[tokio::test]
    async fn extraction_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = worker_config(dir.path(), vec![30301]);
        config.settings.max_listings = 2;
        let factory = MockSessionFactory::new().on_page(
            &config.settings.search_url("GA", 30301),
            page(&["A", "B", "C", "D"]),
        );
        let report = SearchWorker::new(config, Arc::new(factory), Arc::new(JsonListingExtractor), CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert_eq!(report.records_written, 2);
    }

    async fn run_with_scroll(
        settings: SearchSettings,
        script: Vec<Result<ScrollProbe, SessionError>>,
    ) -> (WorkerReport, usize) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = worker_config(dir.path(), vec![30301]);
        let url = settings.search_url("GA", 30301);
        config.settings = settings;
        let factory = Arc::new(
            MockSessionFactory::new()
                .on_page(&url, page(&["Acme Roofing"]))
                .scroll_script(script),
        );
        let report = SearchWorker::new(config, factory.clone(), Arc::new(JsonListingExtractor), CancellationToken::new())
            .run()
            .await
            .unwrap();
        (report, factory.scrolls())
    }

    fn probe(height: u64, items: usize) -> Result<ScrollProbe, SessionError> {
        Ok(ScrollProbe {
            height,
            items,
            end_of_list: false,
        })
    }

    #[tokio::test]
    async fn scrolling_stops_at_listing_cap() {
        let mut s = settings();
        s.max_listings = 5;
        let (report, scrolls) = run_with_scroll(s, vec![probe(10, 2), probe(20, 5), probe(30, 8)]).await;
        assert_eq!(scrolls, 2);
        assert_eq!(report.processed_zips, vec![30301]);
        assert_eq!(report.records_written, 1);
    }

    #[tokio::test]
    async fn scrolling_stops_when_budget_is_spent() {
        let mut s = settings();
        s.scroll_budget = Duration::ZERO;
        let (report, scrolls) = run_with_scroll(s, vec![probe(10, 1)]).await;
        assert_eq!(scrolls, 0);
        assert_eq!(report.records_written, 1);
    }

    #[tokio::test]
    async fn scrolling_stops_after_stalled_scrolls() {
        // First probe sets the baseline, then three identical probes stall out.
        let (report, scrolls) = run_with_scroll(settings(), vec![probe(10, 3)]).await;
        assert_eq!(scrolls, 4);
        assert_eq!(report.processed_zips, vec![30301]);
    }

    #[tokio::test]
    async fn growth_resets_the_stall_count() {
        let script = vec![probe(10, 1), probe(20, 2), probe(20, 2), probe(30, 3)];
        let (_, scrolls) = run_with_scroll(settings(), script).await;
        // (30, 3) repeats from the fourth scroll: baseline plus three stalls.
        assert_eq!(scrolls, 7);
    }

    #[tokio::test]
    async fn scroll_error_is_end_of_content() {
        let script = vec![probe(10, 1), Err(SessionError::Timeout("scroll".into()))];
        let (report, scrolls) = run_with_scroll(settings(), script).await;
        assert_eq!(scrolls, 2);
        assert!(report.failed_zips.is_empty());
        assert_eq!(report.records_written, 1);
    }

    #[tokio::test]
    async fn existing_zip_file_is_merged_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let by_zip = dir.path().join("by_zip");
        let existing = BusinessRecord {
            business_name: "Old Roofing".into(),
            location: "30301".into(),
            ..Default::default()
        };
        dataset::save_list(&by_zip.join("30301.json"), &[existing]).unwrap();

        let s = settings();
        let factory = MockSessionFactory::new()
            .on_page(&s.search_url("GA", 30301), page(&["Old Roofing", "New Roofing"]));
        let report = SearchWorker::new(
            worker_config(dir.path(), vec![30301]),
            Arc::new(factory),
            Arc::new(JsonListingExtractor),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.records_written, 1);
        let records: Vec<BusinessRecord> = dataset::load_list(&by_zip.join("30301.json")).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.business_name.as_str()).collect();
        assert_eq!(names, vec!["Old Roofing", "New Roofing"]);
    }
}
