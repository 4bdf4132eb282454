//! Run log: persisted JSON timeline of every stage and worker event in a run.
//!
//! Each run produces a single `{DATA_DIR}/leads/runs/{run_id}/run_log.json`
//! next to its worker reports.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::dataset;
use crate::stats::RunStats;

pub struct RunLog {
    pub run_id: String,
    pub region: String,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
}

#[derive(Debug, Serialize)]
struct RunEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Resume {
        requested_start: u32,
        effective_start: Option<u32>,
        previous_watermark: Option<u32>,
    },
    Partitioned {
        candidates: usize,
        workers: usize,
    },
    StageStarted {
        stage: String,
    },
    WorkerExited {
        stage: String,
        worker: usize,
        outcome: String,
    },
    Merged {
        dataset: String,
        existing: usize,
        scanned: usize,
        added: usize,
        total: usize,
    },
    Filtered {
        dataset: String,
        kept: usize,
    },
    TrackerAdvanced {
        watermark: u32,
    },
    StageFailed {
        stage: String,
        reason: String,
    },
    Interrupted {
        stage: String,
    },
}

impl RunLog {
    pub fn new(run_id: String, region: String) -> Self {
        Self {
            run_id,
            region,
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
        }
    }

    pub fn log(&mut self, kind: EventKind) {
        self.events.push(RunEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        });
        self.seq += 1;
    }

    /// Write the log under `runs_dir` and return its path.
    pub fn save(&self, runs_dir: &Path, outcome: &str, stats: &RunStats) -> Result<PathBuf> {
        let path = runs_dir.join(&self.run_id).join("run_log.json");

        let output = SerializedRunLog {
            run_id: &self.run_id,
            region: &self.region,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            stats,
            events: &self.events,
        };

        dataset::save_json(&path, &output)?;
        info!(path = %path.display(), events = self.events.len(), "Run log saved");

        Ok(path)
    }
}

#[derive(Serialize)]
struct SerializedRunLog<'a> {
    run_id: &'a str,
    region: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: &'a str,
    stats: &'a RunStats,
    events: &'a [RunEvent],
}
