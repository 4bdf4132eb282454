use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::search_worker::{SearchWorker, WorkerConfig, WorkerReport};
use crate::traits::{RecordExtractor, SessionFactory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failed(String),
    /// Killed after the interrupt grace period ran out.
    Killed,
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerExit::Failed(_))
    }
}

/// A running Stage-1 worker.
#[async_trait]
pub trait WorkerHandle: Send {
    fn index(&self) -> usize;

    /// Wait for the worker to exit. Cancel-safe: dropping the future leaves
    /// the worker running and the handle usable.
    async fn wait(&mut self) -> Result<WorkerExit>;

    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, config: WorkerConfig) -> Result<Box<dyn WorkerHandle>>;
}

// --- Subprocess workers ---

/// Re-invokes the current binary as `search-worker --config <json>`.
pub struct ProcessLauncher {
    exe: PathBuf,
}

impl ProcessLauncher {
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to resolve current executable")?;
        Ok(Self { exe })
    }

    pub fn with_exe(exe: PathBuf) -> Self {
        Self { exe }
    }
}

struct ProcessHandle {
    index: usize,
    child: Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn index(&self) -> usize {
        self.index
    }

    async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("worker {}: waiting for process", self.index))?;
        Ok(if status.success() {
            WorkerExit::Success
        } else {
            WorkerExit::Failed(format!("process exited with {status}"))
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .with_context(|| format!("worker {}: killing process", self.index))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, config: WorkerConfig) -> Result<Box<dyn WorkerHandle>> {
        let index = config.task.worker_index;
        let json = serde_json::to_string(&config)?;
        let child = Command::new(&self.exe)
            .arg("search-worker")
            .arg("--config")
            .arg(json)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("worker {index}: spawning {}", self.exe.display()))?;
        info!(worker = index, pid = child.id(), "Launched search worker process");
        Ok(Box::new(ProcessHandle { index, child }))
    }
}

// --- In-process workers ---

/// Runs workers as tokio tasks sharing one session factory.
pub struct InProcessLauncher {
    factory: Arc<dyn SessionFactory>,
    extractor: Arc<dyn RecordExtractor>,
    cancel: CancellationToken,
}

impl InProcessLauncher {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        extractor: Arc<dyn RecordExtractor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory,
            extractor,
            cancel,
        }
    }
}

struct TaskHandle {
    index: usize,
    task: Option<JoinHandle<Result<WorkerReport>>>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn index(&self) -> usize {
        self.index
    }

    async fn wait(&mut self) -> Result<WorkerExit> {
        let Some(task) = self.task.as_mut() else {
            return Ok(WorkerExit::Killed);
        };
        let joined = task.await;
        self.task = None;
        Ok(match joined {
            Ok(Ok(_)) => WorkerExit::Success,
            Ok(Err(e)) => WorkerExit::Failed(format!("{e:#}")),
            Err(e) if e.is_cancelled() => WorkerExit::Killed,
            Err(e) => WorkerExit::Failed(e.to_string()),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            warn!(worker = self.index, "Aborting in-process worker");
            task.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, config: WorkerConfig) -> Result<Box<dyn WorkerHandle>> {
        let index = config.task.worker_index;
        let worker = SearchWorker::new(
            config,
            self.factory.clone(),
            self.extractor.clone(),
            self.cancel.child_token(),
        );
        let task = tokio::spawn(worker.run());
        Ok(Box::new(TaskHandle {
            index,
            task: Some(task),
        }))
    }
}
