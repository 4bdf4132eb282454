use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use leadgen_common::{BusinessRecord, LeadPaths};

use crate::dataset;
use crate::launcher::{WorkerExit, WorkerHandle, WorkerLauncher};
use crate::merge::{self, business_key, MergeReport};
use crate::partition::SearchTask;
use crate::search_worker::{OutputTarget, SearchSettings, WorkerConfig, WorkerReport};

/// What came back from one batch of search workers.
#[derive(Debug, Default)]
pub struct Stage1Outcome {
    pub exits: Vec<(usize, WorkerExit)>,
    pub reports: Vec<WorkerReport>,
    pub interrupted: bool,
}

impl Stage1Outcome {
    pub fn failed_workers(&self) -> Vec<(usize, String)> {
        self.exits
            .iter()
            .filter_map(|(idx, exit)| match exit {
                WorkerExit::Failed(reason) => Some((*idx, reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Every ZIP whose attempt concluded, across all workers.
    pub fn processed(&self) -> HashSet<u32> {
        self.reports
            .iter()
            .flat_map(|r| r.processed_zips.iter().copied())
            .collect()
    }

    pub fn failed_zips(&self) -> usize {
        self.reports.iter().map(|r| r.failed_zips.len()).sum()
    }

    pub fn records_written(&self) -> usize {
        self.reports.iter().map(|r| r.records_written).sum()
    }
}

/// Search, merge and filter for the map-search stage.
pub struct Stage1Pipeline {
    paths: LeadPaths,
    output: OutputTarget,
    settings: SearchSettings,
    launcher: Arc<dyn WorkerLauncher>,
    cancel: CancellationToken,
    grace: Duration,
}

impl Stage1Pipeline {
    pub fn new(
        paths: LeadPaths,
        output: OutputTarget,
        settings: SearchSettings,
        launcher: Arc<dyn WorkerLauncher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            paths,
            output,
            settings,
            launcher,
            cancel,
            grace: Duration::from_secs(10),
        }
    }

    /// How long interrupted workers get to write their reports before being killed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Launch one worker per task and join them all.
    pub async fn search(&self, run_id: &str, tasks: Vec<SearchTask>) -> Result<Stage1Outcome> {
        let reports_dir = self.paths.reports_dir(run_id);
        dataset::ensure_dir(&reports_dir)?;
        match &self.output {
            OutputTarget::ByZip { dir } => dataset::ensure_dir(dir)?,
            OutputTarget::SingleFile { path } => {
                if let Some(parent) = path.parent() {
                    dataset::ensure_dir(parent)?;
                }
            }
        }

        let mut outcome = Stage1Outcome::default();
        let mut handles: Vec<Box<dyn WorkerHandle>> = Vec::new();
        let mut report_paths = Vec::new();

        for task in tasks {
            let index = task.worker_index;
            let report_path = reports_dir.join(format!("worker-{index:02}.json"));
            report_paths.push((index, report_path.clone()));
            let config = WorkerConfig {
                run_id: run_id.to_string(),
                task,
                output: self.output.clone(),
                report_path,
                settings: self.settings.clone(),
            };
            match self.launcher.launch(config).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = index, error = %e, "Failed to launch search worker");
                    outcome.exits.push((index, WorkerExit::Failed(format!("{e:#}"))));
                }
            }
        }

        info!(stage = "stage1_search", workers = handles.len(), run_id, "Waiting for search workers");
        let (exits, interrupted) = self.join(handles).await?;
        outcome.exits.extend(exits);
        outcome.exits.sort_by_key(|(idx, _)| *idx);
        outcome.interrupted = interrupted;

        for (index, path) in report_paths {
            let report = match WorkerReport::load(&path) {
                Ok(Some(report)) => report,
                Ok(None) => WorkerReport::new(index),
                Err(e) => {
                    warn!(worker = index, error = %e, "Unreadable worker report");
                    WorkerReport::new(index)
                }
            };
            if report.interrupted {
                outcome.interrupted = true;
            }
            outcome.reports.push(report);
        }

        for (index, reason) in outcome.failed_workers() {
            error!(stage = "stage1_search", worker = index, reason = reason.as_str(), "Search worker failed");
        }
        Ok(outcome)
    }

    /// Wait for every worker. After cancellation the remaining workers share
    /// one grace deadline and are killed once it passes.
    async fn join(&self, handles: Vec<Box<dyn WorkerHandle>>) -> Result<(Vec<(usize, WorkerExit)>, bool)> {
        let mut exits = Vec::with_capacity(handles.len());
        let mut deadline: Option<Instant> = None;

        for mut handle in handles {
            let index = handle.index();
            if deadline.is_none() {
                tokio::select! {
                    exit = handle.wait() => {
                        exits.push((index, exit?));
                        continue;
                    }
                    _ = self.cancel.cancelled() => {
                        warn!(grace_secs = self.grace.as_secs(), "Interrupted, waiting for workers to stop");
                        deadline = Some(Instant::now() + self.grace);
                    }
                }
            }

            let until = deadline.unwrap_or_else(Instant::now);
            match tokio::time::timeout_at(until, handle.wait()).await {
                Ok(exit) => exits.push((index, exit?)),
                Err(_) => {
                    warn!(worker = index, "Worker did not stop in time, killing");
                    handle.kill().await?;
                    exits.push((index, WorkerExit::Killed));
                }
            }
        }

        Ok((exits, deadline.is_some()))
    }

    /// Fold worker output into the canonical Stage-1 dataset.
    pub fn merge(&self) -> Result<MergeReport> {
        let report = match &self.output {
            OutputTarget::ByZip { dir } => {
                merge::merge_partition_dir::<BusinessRecord, _, _>(&self.paths.search_results, dir, business_key)?
            }
            OutputTarget::SingleFile { path } => {
                let existing: Vec<BusinessRecord> = dataset::load_list_lenient(&self.paths.search_results)?;
                let found: Vec<BusinessRecord> = dataset::load_list_lenient(path).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable output file");
                    Vec::new()
                });
                let (merged, report) = merge::merge_by(existing, vec![found], business_key);
                dataset::save_list(&self.paths.search_results, &merged)?;
                report
            }
        };
        info!(stage = "stage1_search", %report, "Stage 1 merge complete");
        Ok(report)
    }

    /// Write the named-without-website subset. Returns its size.
    pub fn filter(&self) -> Result<usize> {
        let records: Vec<BusinessRecord> = dataset::load_list_lenient(&self.paths.search_results)
            .context("Loading Stage 1 results")?;
        let filtered = merge::named_without_website(&records);
        dataset::save_list(&self.paths.search_filtered, &filtered)?;
        info!(
            stage = "stage1_filter",
            total = records.len(),
            kept = filtered.len(),
            "Filtered to businesses without a website"
        );
        Ok(filtered.len())
    }
}
