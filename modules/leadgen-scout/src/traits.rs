// Trait seams between the orchestration core and the browser.
//
// BrowserSession: one automated browser context owned by exactly one worker.
// SessionFactory: creates sessions, and re-creates them after transient failures.
// RecordExtractor / DirectoryExtractor: page content -> raw records.
//
// Workers only see these traits, so tests drive them with MockSession and
// JSON extractors from `testing` instead of a real browser.

use async_trait::async_trait;
use thiserror::Error;

use crate::extract::{DirectoryCard, ExtractError, RawListing};

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Blocked by anti-automation page at {0}")]
    Blocked(String),

    #[error("Page failed to load: {0}")]
    Load(String),

    #[error("Browser unavailable: {0}")]
    Unavailable(String),
}

impl SessionError {
    /// Timeouts and blocks are cleared by throwing the session away.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Timeout(_) | SessionError::Blocked(_))
    }
}

/// What one scroll of the results container revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrollProbe {
    /// Scroll height of the results container after the scroll settled.
    pub height: u64,
    /// Result cards currently rendered.
    pub items: usize,
    /// The provider showed its explicit end-of-list marker.
    pub end_of_list: bool,
}

#[async_trait]
pub trait BrowserSession: Send {
    /// Navigate to `url` and wait, bounded, for the results container.
    /// Failure here aborts the unit of work that asked for the page.
    async fn open(&mut self, url: &str) -> Result<(), SessionError>;

    /// Scroll the results container to its bottom and report what is loaded.
    async fn scroll(&mut self) -> Result<ScrollProbe, SessionError>;

    /// Content of the currently open page.
    async fn content(&mut self) -> Result<String, SessionError>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}

pub trait RecordExtractor: Send + Sync {
    /// One entry per listing found in `content`, in page order. A listing that
    /// cannot be parsed yields an error without affecting its neighbours.
    fn extract(&self, content: &str) -> Vec<Result<RawListing, ExtractError>>;
}

pub trait DirectoryExtractor: Send + Sync {
    /// Result cards in page order, promoted ones included and flagged.
    fn cards(&self, content: &str) -> Vec<DirectoryCard>;
}
