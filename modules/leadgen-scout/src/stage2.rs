//! Directory matching: a bounded queue of Stage-1 leads drained by a fixed
//! pool of lookup workers, each with its own browser session.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use leadgen_common::{
    is_present, BusinessRecord, Config, DelayRange, DirectoryMatchRecord, LeadPaths,
};

use crate::dataset;
use crate::extract::first_organic;
use crate::merge::{self, match_key, MergeReport};
use crate::search_worker::pace;
use crate::traits::{BrowserSession, DirectoryExtractor, SessionFactory};

/// Directory search URL for one business.
pub fn directory_lookup_url(base: &str, name: &str, location: &str) -> Result<String, url::ParseError> {
    let url = url::Url::parse_with_params(
        base,
        &[
            ("find_country", "USA"),
            ("find_text", name),
            ("find_loc", location),
            ("page", "1"),
        ],
    )?;
    Ok(url.to_string())
}

/// Trimmed business names already handled by an earlier run: merged
/// matches, unmerged worker parts and final leads.
pub fn known_names(paths: &LeadPaths) -> Result<HashSet<String>> {
    let mut sources = vec![paths.directory_matches.clone(), paths.final_leads.clone()];
    sources.extend(dataset::partition_files(&paths.directory_parts_dir)?);

    let mut names = HashSet::new();
    for path in sources {
        match dataset::load_list_lenient::<DirectoryMatchRecord>(&path) {
            Ok(records) => names.extend(
                records
                    .into_iter()
                    .map(|r| r.business.business_name.trim().to_string()),
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable match file"),
        }
    }
    Ok(names)
}

/// Leads worth looking up, in input order, each business name at most once.
pub fn select_candidates(filtered: &[BusinessRecord], known: &HashSet<String>) -> Vec<BusinessRecord> {
    let mut enqueued = HashSet::new();
    filtered
        .iter()
        .filter(|r| {
            let name = r.business_name.trim();
            is_present(name)
                && is_present(&r.location)
                && !known.contains(name)
                && enqueued.insert(name.to_string())
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stage2Outcome {
    pub candidates: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub session_restarts: usize,
    pub failed_workers: Vec<(usize, String)>,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct WorkerTally {
    matched: usize,
    unmatched: usize,
    session_restarts: usize,
}

struct MatchContext {
    run_id: String,
    parts_dir: PathBuf,
    search_url: String,
    delay: DelayRange,
    factory: Arc<dyn SessionFactory>,
    extractor: Arc<dyn DirectoryExtractor>,
    cancel: CancellationToken,
}

pub struct Stage2Pipeline {
    paths: LeadPaths,
    directory_search_url: String,
    match_delay: DelayRange,
    workers: usize,
    factory: Arc<dyn SessionFactory>,
    extractor: Arc<dyn DirectoryExtractor>,
    cancel: CancellationToken,
}

impl Stage2Pipeline {
    pub fn new(
        config: &Config,
        workers: usize,
        factory: Arc<dyn SessionFactory>,
        extractor: Arc<dyn DirectoryExtractor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            paths: config.paths(),
            directory_search_url: config.directory_search_url.clone(),
            match_delay: config.match_delay,
            workers: workers.max(1),
            factory,
            extractor,
            cancel,
        }
    }

    /// Look up every new candidate from the filtered Stage-1 dataset. Each
    /// worker writes its part file before this returns.
    pub async fn run_match(&self, run_id: &str) -> Result<Stage2Outcome> {
        dataset::ensure_dir(&self.paths.directory_parts_dir)?;
        dataset::ensure_dir(&self.paths.final_dir)?;

        let filtered: Vec<BusinessRecord> = dataset::load_list_lenient(&self.paths.search_filtered)
            .context("Loading filtered Stage 1 results")?;
        let known = known_names(&self.paths)?;
        let candidates = select_candidates(&filtered, &known);
        info!(
            stage = "stage2_match",
            filtered = filtered.len(),
            known = known.len(),
            candidates = candidates.len(),
            workers = self.workers,
            "Directory matching starting"
        );

        let mut outcome = Stage2Outcome {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let ctx = Arc::new(MatchContext {
            run_id: run_id.to_string(),
            parts_dir: self.paths.directory_parts_dir.clone(),
            search_url: self.directory_search_url.clone(),
            delay: self.match_delay,
            factory: self.factory.clone(),
            extractor: self.extractor.clone(),
            cancel: self.cancel.clone(),
        });

        let (tx, rx) = mpsc::channel::<BusinessRecord>(self.workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<_> = (0..self.workers.min(candidates.len()))
            .map(|index| {
                let ctx = ctx.clone();
                let rx = rx.clone();
                (index, tokio::spawn(match_worker(ctx, index, rx)))
            })
            .collect();
        drop(rx);

        for candidate in candidates {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = tx.send(candidate) => {
                    if sent.is_err() {
                        warn!("All match workers exited, stopping the queue");
                        break;
                    }
                }
            }
        }
        drop(tx);

        for (index, handle) in handles {
            match handle.await {
                Ok(Ok(tally)) => {
                    outcome.matched += tally.matched;
                    outcome.unmatched += tally.unmatched;
                    outcome.session_restarts += tally.session_restarts;
                }
                Ok(Err(e)) => {
                    error!(stage = "stage2_match", worker = index, error = %e, "Match worker failed");
                    outcome.failed_workers.push((index, format!("{e:#}")));
                }
                Err(e) => {
                    error!(stage = "stage2_match", worker = index, error = %e, "Match worker panicked");
                    outcome.failed_workers.push((index, e.to_string()));
                }
            }
        }

        outcome.interrupted = self.cancel.is_cancelled();
        info!(
            stage = "stage2_match",
            matched = outcome.matched,
            unmatched = outcome.unmatched,
            restarts = outcome.session_restarts,
            interrupted = outcome.interrupted,
            "Directory matching finished"
        );
        Ok(outcome)
    }

    /// Fold worker parts into the raw match dataset.
    pub fn merge(&self) -> Result<MergeReport> {
        let report = merge::merge_partition_dir::<DirectoryMatchRecord, _, _>(
            &self.paths.directory_matches,
            &self.paths.directory_parts_dir,
            match_key,
        )?;
        info!(stage = "stage2_match", %report, "Stage 2 merge complete");
        Ok(report)
    }

    /// Rewrite the final lead list from every matched record.
    pub fn final_filter(&self) -> Result<MergeReport> {
        let existing: Vec<DirectoryMatchRecord> = dataset::load_list_lenient(&self.paths.final_leads)?;
        let matches: Vec<DirectoryMatchRecord> = dataset::load_list_lenient(&self.paths.directory_matches)?;
        let (leads, report) = merge::final_leads(existing, matches);
        dataset::save_list(&self.paths.final_leads, &leads)?;
        info!(stage = "stage2_filter", %report, "Final leads written");
        Ok(report)
    }
}

async fn match_worker(
    ctx: Arc<MatchContext>,
    index: usize,
    queue: Arc<Mutex<mpsc::Receiver<BusinessRecord>>>,
) -> Result<WorkerTally> {
    let mut tally = WorkerTally::default();
    let mut buffer: Vec<DirectoryMatchRecord> = Vec::new();
    let mut session: Option<Box<dyn BrowserSession>> = None;

    let result = async {
        let mut first = true;
        loop {
            if !first && !pace(ctx.delay, &ctx.cancel).await {
                break;
            }
            first = false;

            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => None,
                    record = rx.recv() => record,
                }
            };
            let Some(record) = next else { break };

            let matched = lookup(&ctx, index, &mut session, &mut tally, record).await?;
            if matched.is_matched() {
                tally.matched += 1;
            } else {
                tally.unmatched += 1;
            }
            buffer.push(matched);
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if !buffer.is_empty() {
        let part = ctx
            .parts_dir
            .join(format!("{}-worker-{index:02}.json", ctx.run_id));
        dataset::save_list(&part, &buffer)
            .with_context(|| format!("match worker {index}: writing {}", part.display()))?;
        debug!(worker = index, records = buffer.len(), "Flushed match buffer");
    }

    result.map(|_| tally)
}

/// One directory lookup. Page failures never fail the worker; only an
/// unobtainable session does.
async fn lookup(
    ctx: &MatchContext,
    index: usize,
    session: &mut Option<Box<dyn BrowserSession>>,
    tally: &mut WorkerTally,
    record: BusinessRecord,
) -> Result<DirectoryMatchRecord> {
    let name = record.business_name.trim().to_string();
    let url = match directory_lookup_url(&ctx.search_url, &name, &record.location) {
        Ok(url) => url,
        Err(e) => {
            warn!(worker = index, business = name.as_str(), error = %e, "Bad directory search URL");
            return Ok(DirectoryMatchRecord::unmatched(record));
        }
    };

    let mut active = match session.take() {
        Some(active) => active,
        None => ctx
            .factory
            .create()
            .await
            .with_context(|| format!("match worker {index}: creating browser session"))?,
    };

    let page = match active.open(&url).await {
        Ok(()) => active.content().await,
        Err(e) => Err(e),
    };

    match page {
        Ok(html) => {
            *session = Some(active);
            let cards = ctx.extractor.cards(&html);
            Ok(match first_organic(&cards) {
                Some(card) => {
                    debug!(worker = index, business = name.as_str(), url = card.hit.url.as_str(), "Matched");
                    DirectoryMatchRecord::from_hits(record, std::slice::from_ref(&card.hit))
                }
                None => DirectoryMatchRecord::unmatched(record),
            })
        }
        Err(e) if e.is_transient() => {
            warn!(
                worker = index,
                session = active.name(),
                business = name.as_str(),
                error = %e,
                "Transient failure, recreating session"
            );
            drop(active);
            tally.session_restarts += 1;
            Ok(DirectoryMatchRecord::unmatched(record))
        }
        Err(e) => {
            *session = Some(active);
            warn!(worker = index, business = name.as_str(), error = %e, "Directory lookup failed");
            Ok(DirectoryMatchRecord::unmatched(record))
        }
    }
}
