use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use leadgen_common::{normalize_region, Config, LeadPaths, LeadgenError};

use crate::launcher::WorkerLauncher;
use crate::partition::{candidate_zips, filter_candidates, ZipPartitioner};
use crate::run_log::{EventKind, RunLog};
use crate::search_worker::{OutputTarget, SearchSettings};
use crate::stage1::Stage1Pipeline;
use crate::stage2::Stage2Pipeline;
use crate::stats::RunStats;
use crate::tracker::{processed_prefix, ProgressTrackerStore, ResumePlan};
use crate::traits::{DirectoryExtractor, SessionFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Stage1Search,
    Stage1Filter,
    Stage2Match,
    Stage2Filter,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Stage1Search => "stage1_search",
            PipelineStage::Stage1Filter => "stage1_filter",
            PipelineStage::Stage2Match => "stage2_match",
            PipelineStage::Stage2Filter => "stage2_filter",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { stats: RunStats },
    NoOp { reason: String },
    Interrupted { stage: PipelineStage, stats: RunStats },
    Failed { stage: PipelineStage, reason: String, stats: RunStats },
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed { .. } | RunOutcome::NoOp { .. } => 0,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::Interrupted { .. } => 130,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::NoOp { .. } => "no_op",
            RunOutcome::Interrupted { .. } => "interrupted",
            RunOutcome::Failed { .. } => "failed",
        }
    }

    pub fn stats(&self) -> Option<&RunStats> {
        match self {
            RunOutcome::Completed { stats }
            | RunOutcome::Interrupted { stats, .. }
            | RunOutcome::Failed { stats, .. } => Some(stats),
            RunOutcome::NoOp { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageSelection {
    #[default]
    Full,
    SearchOnly,
}

/// One invocation of the pipeline for a region.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub region: String,
    pub start_zip: u32,
    pub end_zip: u32,
    /// Replaces the range as the candidate source.
    pub zip_list: Option<Vec<u32>>,
    pub tracker_bypass: bool,
    pub output_by_zip_dir: Option<PathBuf>,
    /// Legacy mode: every worker appends to this one file.
    pub single_file: Option<PathBuf>,
    pub search_workers: usize,
    pub match_workers: usize,
    pub stages: StageSelection,
}

impl RunRequest {
    pub fn new(region: &str, start_zip: u32, end_zip: u32, config: &Config) -> Self {
        Self {
            region: normalize_region(region),
            start_zip,
            end_zip,
            zip_list: None,
            tracker_bypass: false,
            output_by_zip_dir: None,
            single_file: None,
            search_workers: config.workers,
            match_workers: config.match_workers,
            stages: StageSelection::Full,
        }
    }

    fn output(&self, paths: &LeadPaths) -> OutputTarget {
        match (&self.single_file, &self.output_by_zip_dir) {
            (Some(path), _) => OutputTarget::SingleFile { path: path.clone() },
            (None, Some(dir)) => OutputTarget::ByZip { dir: dir.clone() },
            (None, None) => OutputTarget::ByZip {
                dir: paths.by_zip_dir.clone(),
            },
        }
    }
}

/// Run log, stats and current stage of one run.
struct RunState {
    log: RunLog,
    stats: RunStats,
    stage: PipelineStage,
}

impl RunState {
    fn enter(&mut self, stage: PipelineStage) {
        info!(stage = stage.as_str(), run_id = self.log.run_id.as_str(), "Entering stage");
        self.stage = stage;
        self.log.log(EventKind::StageStarted {
            stage: stage.as_str().to_string(),
        });
    }

    fn fail(&mut self, reason: String) -> RunOutcome {
        let stage = self.stage;
        error!(stage = stage.as_str(), reason = reason.as_str(), "Stage failed");
        self.log.log(EventKind::StageFailed {
            stage: stage.as_str().to_string(),
            reason: reason.clone(),
        });
        self.stage = PipelineStage::Failed;
        RunOutcome::Failed {
            stage,
            reason,
            stats: self.stats.clone(),
        }
    }

    fn interrupted(&mut self) -> RunOutcome {
        warn!(stage = self.stage.as_str(), "Run interrupted");
        self.log.log(EventKind::Interrupted {
            stage: self.stage.as_str().to_string(),
        });
        RunOutcome::Interrupted {
            stage: self.stage,
            stats: self.stats.clone(),
        }
    }

    fn completed(&mut self) -> RunOutcome {
        self.stage = PipelineStage::Done;
        RunOutcome::Completed {
            stats: self.stats.clone(),
        }
    }
}

/// Drives Stage 1 and Stage 2 for a run and owns the progress tracker.
pub struct PipelineOrchestrator {
    config: Config,
    paths: LeadPaths,
    launcher: Arc<dyn WorkerLauncher>,
    directory_factory: Arc<dyn SessionFactory>,
    directory_extractor: Arc<dyn DirectoryExtractor>,
    cancel: CancellationToken,
    grace: Duration,
    run_id: String,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Config,
        launcher: Arc<dyn WorkerLauncher>,
        directory_factory: Arc<dyn SessionFactory>,
        directory_extractor: Arc<dyn DirectoryExtractor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            paths: config.paths(),
            config,
            launcher,
            directory_factory,
            directory_extractor,
            cancel,
            grace: Duration::from_secs(10),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stage 1 for `request`, then Stage 2 unless the request stops early.
    pub async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        let region = normalize_region(&request.region);
        let partitioner = ZipPartitioner::new(request.search_workers)?;

        // Bypass leaves the tracker file unread and unwritten.
        let mut tracker = if request.tracker_bypass {
            info!(region = region.as_str(), "Tracker bypass enabled");
            None
        } else {
            Some(ProgressTrackerStore::load(&self.paths.tracker)?)
        };
        let plan = match tracker.as_ref() {
            Some(store) => store.resume(&region, request.start_zip, request.end_zip),
            None => ResumePlan::Fresh {
                start: request.start_zip,
            },
        };

        let mut state = RunState {
            log: RunLog::new(self.run_id.clone(), region.clone()),
            stats: RunStats::default(),
            stage: PipelineStage::Stage1Search,
        };
        state.log.log(EventKind::Resume {
            requested_start: request.start_zip,
            effective_start: plan.start(),
            previous_watermark: plan.previous(),
        });

        let Some(effective_start) = plan.start() else {
            return Ok(self.no_op(format!(
                "{region} already scraped through {}",
                plan.previous().unwrap_or(request.end_zip)
            )));
        };

        let candidates = match &request.zip_list {
            Some(list) => filter_candidates(&region, list, effective_start),
            None => candidate_zips(&region, effective_start, request.end_zip),
        };
        if candidates.is_empty() {
            return Ok(self.no_op(format!("no candidate ZIPs for {region}")));
        }

        let tasks = partitioner.partition(&region, &candidates);
        state.stats.candidate_zips = candidates.len() as u32;
        state.stats.search_workers = tasks.len() as u32;
        state.log.log(EventKind::Partitioned {
            candidates: candidates.len(),
            workers: tasks.len(),
        });
        info!(
            region = region.as_str(),
            candidates = candidates.len(),
            workers = tasks.len(),
            first = candidates[0],
            last = candidates[candidates.len() - 1],
            run_id = self.run_id.as_str(),
            "Partitioned search space"
        );

        // Stage 1: search
        state.enter(PipelineStage::Stage1Search);
        let stage1 = Stage1Pipeline::new(
            self.paths.clone(),
            request.output(&self.paths),
            SearchSettings::from_config(&self.config),
            self.launcher.clone(),
            self.cancel.clone(),
        )
        .with_grace(self.grace);

        let outcome = stage1.search(&self.run_id, tasks).await?;
        for (worker, exit) in &outcome.exits {
            state.log.log(EventKind::WorkerExited {
                stage: PipelineStage::Stage1Search.as_str().to_string(),
                worker: *worker,
                outcome: format!("{exit:?}"),
            });
        }
        let processed = outcome.processed();
        state.stats.zips_processed = processed.len() as u32;
        state.stats.zips_failed = outcome.failed_zips() as u32;
        state.stats.records_written = outcome.records_written() as u32;

        let failed = outcome.failed_workers();
        if !failed.is_empty() {
            state.stats.search_workers_failed = failed.len() as u32;
            let reason = failed
                .iter()
                .map(|(idx, why)| format!("worker {idx}: {why}"))
                .collect::<Vec<_>>()
                .join("; ");
            let result = state.fail(reason);
            return Ok(self.finish(state, result));
        }

        let merged = stage1.merge()?;
        state.stats.search_results_total = merged.total as u32;
        state.stats.search_results_added = merged.added as u32;
        state.log.log(EventKind::Merged {
            dataset: "search_results".into(),
            existing: merged.existing,
            scanned: merged.scanned,
            added: merged.added,
            total: merged.total,
        });

        // Stage 1: filter
        state.enter(PipelineStage::Stage1Filter);
        let kept = stage1.filter()?;
        state.stats.leads_without_website = kept as u32;
        state.log.log(EventKind::Filtered {
            dataset: "search_filtered".into(),
            kept,
        });

        if let Some(tracker) = tracker.as_mut() {
            if let Some(watermark) = processed_prefix(&candidates, &processed) {
                if tracker.advance(&region, effective_start, watermark) {
                    tracker.save()?;
                    state.stats.watermark = Some(watermark);
                    state.log.log(EventKind::TrackerAdvanced { watermark });
                }
            }
        }

        if outcome.interrupted {
            state.stage = PipelineStage::Stage1Search;
            let result = state.interrupted();
            return Ok(self.finish(state, result));
        }

        if request.stages == StageSelection::SearchOnly {
            let result = state.completed();
            return Ok(self.finish(state, result));
        }

        let result = self.stage2(&mut state, request.match_workers).await?;
        Ok(self.finish(state, result))
    }

    /// Stage 2 on its own, over whatever Stage 1 left on disk.
    pub async fn run_match(&self, match_workers: usize) -> Result<RunOutcome> {
        let mut state = RunState {
            log: RunLog::new(self.run_id.clone(), "all".to_string()),
            stats: RunStats::default(),
            stage: PipelineStage::Stage2Match,
        };
        let result = self.stage2(&mut state, match_workers).await?;
        Ok(self.finish(state, result))
    }

    async fn stage2(&self, state: &mut RunState, match_workers: usize) -> Result<RunOutcome> {
        if match_workers == 0 {
            return Err(LeadgenError::Config("match worker count must be at least 1".into()).into());
        }
        state.enter(PipelineStage::Stage2Match);
        let stage2 = Stage2Pipeline::new(
            &self.config,
            match_workers,
            self.directory_factory.clone(),
            self.directory_extractor.clone(),
            self.cancel.clone(),
        );

        let outcome = stage2.run_match(&self.run_id).await?;
        state.stats.match_candidates = outcome.candidates as u32;
        state.stats.matched = outcome.matched as u32;
        state.stats.unmatched = outcome.unmatched as u32;
        state.stats.session_restarts = outcome.session_restarts as u32;
        state.stats.match_workers_failed = outcome.failed_workers.len() as u32;

        if !outcome.failed_workers.is_empty() {
            let reason = outcome
                .failed_workers
                .iter()
                .map(|(idx, why)| format!("match worker {idx}: {why}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(state.fail(reason));
        }

        let merged = stage2.merge()?;
        state.log.log(EventKind::Merged {
            dataset: "directory_matches".into(),
            existing: merged.existing,
            scanned: merged.scanned,
            added: merged.added,
            total: merged.total,
        });

        state.enter(PipelineStage::Stage2Filter);
        let leads = stage2.final_filter()?;
        state.stats.final_leads_total = leads.total as u32;
        state.stats.final_leads_added = leads.added as u32;
        state.log.log(EventKind::Merged {
            dataset: "final_leads".into(),
            existing: leads.existing,
            scanned: leads.scanned,
            added: leads.added,
            total: leads.total,
        });

        if outcome.interrupted {
            state.stage = PipelineStage::Stage2Match;
            return Ok(state.interrupted());
        }
        Ok(state.completed())
    }

    fn no_op(&self, reason: String) -> RunOutcome {
        info!(reason = reason.as_str(), "Nothing to do");
        RunOutcome::NoOp { reason }
    }

    fn finish(&self, state: RunState, outcome: RunOutcome) -> RunOutcome {
        if let Err(e) = state.log.save(&self.paths.runs_dir, outcome.label(), &state.stats) {
            warn!(error = %e, "Failed to save run log");
        }
        info!("{}", state.stats);
        outcome
    }
}
