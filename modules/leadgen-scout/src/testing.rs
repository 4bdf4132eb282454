// Test mocks for the lead pipeline.
//
// Mocks matching the trait boundaries:
// - MockSessionFactory / MockSession (SessionFactory / BrowserSession): HashMap-based URL->page,
//   with an optional scripted scroll sequence and per-URL cancel hooks
// - JsonListingExtractor (RecordExtractor): page content is a JSON array of RawListing
// - JsonDirectoryExtractor (DirectoryExtractor): page content is a JSON array of DirectoryCard

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::extract::{DirectoryCard, ExtractError, RawListing};
use crate::traits::{
    BrowserSession, DirectoryExtractor, RecordExtractor, ScrollProbe, SessionError, SessionFactory,
};

// ---------------------------------------------------------------------------
// MockSessionFactory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    pages: HashMap<String, Result<String, SessionError>>,
    scroll_script: Vec<Result<ScrollProbe, SessionError>>,
    cancel_on_open: HashMap<String, CancellationToken>,
    opened: Mutex<Vec<String>>,
    created: AtomicUsize,
    scrolls: AtomicUsize,
}

/// URL-keyed session factory. Opening an unregistered URL is a load error.
/// Builder pattern: `.on_page()`, `.on_error()`, `.scroll_script()`,
/// `.cancel_on_open()`, `.fail_create()`.
pub struct MockSessionFactory {
    shared: Arc<Shared>,
    fail_create: bool,
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            fail_create: false,
        }
    }

    fn shared_mut(&mut self) -> &mut Shared {
        Arc::get_mut(&mut self.shared).expect("configure the mock before creating sessions")
    }

    pub fn on_page(mut self, url: &str, content: impl Into<String>) -> Self {
        self.shared_mut().pages.insert(url.to_string(), Ok(content.into()));
        self
    }

    pub fn on_error(mut self, url: &str, error: SessionError) -> Self {
        self.shared_mut().pages.insert(url.to_string(), Err(error));
        self
    }

    /// Scroll results replayed after every `open`. The last entry repeats once
    /// the script runs out; an empty script reports end-of-list immediately.
    pub fn scroll_script(mut self, script: Vec<Result<ScrollProbe, SessionError>>) -> Self {
        self.shared_mut().scroll_script = script;
        self
    }

    /// Cancel `token` as soon as any session opens `url`.
    pub fn cancel_on_open(mut self, url: &str, token: CancellationToken) -> Self {
        self.shared_mut().cancel_on_open.insert(url.to_string(), token);
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Sessions handed out so far.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Scrolls performed across all sessions.
    pub fn scrolls(&self) -> usize {
        self.shared.scrolls.load(Ordering::SeqCst)
    }

    /// Every URL any session opened, in order.
    pub fn opened(&self) -> Vec<String> {
        self.shared.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        if self.fail_create {
            return Err(SessionError::Unavailable("MockSessionFactory: create disabled".into()));
        }
        let id = self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            name: format!("mock-{id}"),
            shared: self.shared.clone(),
            page: None,
            cursor: 0,
        }))
    }
}

// ---------------------------------------------------------------------------
// MockSession
// ---------------------------------------------------------------------------

pub struct MockSession {
    name: String,
    shared: Arc<Shared>,
    page: Option<String>,
    cursor: usize,
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        self.shared.opened.lock().unwrap().push(url.to_string());
        self.page = None;
        self.cursor = 0;
        if let Some(token) = self.shared.cancel_on_open.get(url) {
            token.cancel();
        }
        match self.shared.pages.get(url) {
            Some(Ok(content)) => {
                self.page = Some(content.clone());
                Ok(())
            }
            Some(Err(e)) => Err(e.clone()),
            None => Err(SessionError::Load(format!("MockSession: no page registered for {url}"))),
        }
    }

    async fn scroll(&mut self) -> Result<ScrollProbe, SessionError> {
        let page = self
            .page
            .as_deref()
            .ok_or_else(|| SessionError::Load("MockSession: no page open".into()))?;
        self.shared.scrolls.fetch_add(1, Ordering::SeqCst);

        let script = &self.shared.scroll_script;
        let Some(step) = script.get(self.cursor).or_else(|| script.last()) else {
            return Ok(ScrollProbe {
                height: page.len() as u64,
                items: 0,
                end_of_list: true,
            });
        };
        self.cursor += 1;
        step.clone()
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        self.page
            .clone()
            .ok_or_else(|| SessionError::Load("MockSession: no page open".into()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// Reads page content as a JSON array of listings. Non-JSON content has none.
pub struct JsonListingExtractor;

impl RecordExtractor for JsonListingExtractor {
    fn extract(&self, content: &str) -> Vec<Result<RawListing, ExtractError>> {
        let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(content) else {
            return Vec::new();
        };
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                serde_json::from_value(value).map_err(|e| ExtractError::Malformed {
                    index: i + 1,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

/// Reads page content as a JSON array of directory cards.
pub struct JsonDirectoryExtractor;

impl DirectoryExtractor for JsonDirectoryExtractor {
    fn cards(&self, content: &str) -> Vec<DirectoryCard> {
        serde_json::from_str(content).unwrap_or_default()
    }
}
