use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use browserless_client::{BrowserlessClient, ContentRequest};
use leadgen_common::{BrowserBackend, Config};

use crate::traits::{BrowserSession, ScrollProbe, SessionError, SessionFactory};

/// How to recognise a page of a given provider once it has rendered.
#[derive(Debug, Clone)]
pub struct PageProfile {
    /// CSS selector a remote browser waits for before dumping the DOM.
    pub ready_selector: &'static str,
    /// Substring whose presence means the results container rendered.
    pub ready_marker: &'static str,
    /// Substring counted once per result card.
    pub item_marker: &'static str,
}

impl PageProfile {
    pub fn map_search() -> Self {
        Self {
            ready_selector: "div[role='feed']",
            ready_marker: r#"role="feed""#,
            item_marker: r#"role="article""#,
        }
    }

    pub fn directory_search() -> Self {
        Self {
            ready_selector: "div.not-sidebar.stack",
            ready_marker: "not-sidebar",
            item_marker: "result-card",
        }
    }
}

const INTERSTITIAL_MARKERS: &[&str] = &[
    "Just a moment...",
    "Checking your browser",
    "unusual traffic from your computer network",
    "cf-challenge",
];

fn is_interstitial(html: &str) -> bool {
    INTERSTITIAL_MARKERS.iter().any(|m| html.contains(m))
}

/// Classify a freshly rendered page.
fn check_rendered(profile: &PageProfile, url: &str, html: &str) -> Result<(), SessionError> {
    if is_interstitial(html) {
        return Err(SessionError::Blocked(url.to_string()));
    }
    if !html.contains(profile.ready_marker) {
        return Err(SessionError::Timeout(format!(
            "{} on {url}",
            profile.ready_selector
        )));
    }
    Ok(())
}

/// Both backends render the page in one shot, so the first scroll already
/// sees everything the page will ever show.
fn probe(profile: &PageProfile, html: &str) -> ScrollProbe {
    ScrollProbe {
        height: html.len() as u64,
        items: html.matches(profile.item_marker).count(),
        end_of_list: true,
    }
}

// --- Chrome ---

/// Max retry attempts for transient Chrome launch failures (e.g. "Cannot fork").
const CHROME_MAX_ATTEMPTS: u32 = 3;
/// Base backoff for Chrome retries. Actual delay is base * 3^attempt + jitter.
const CHROME_RETRY_BASE: Duration = Duration::from_secs(3);
/// Process startup on top of the page-load budget.
const CHROME_STARTUP: Duration = Duration::from_secs(20);

/// Headless Chromium driven through `--dump-dom`, one process per page load,
/// with a throwaway profile directory per launch.
pub struct ChromeSession {
    bin: String,
    profile: PageProfile,
    page_load_timeout: Duration,
    page: Option<String>,
}

impl ChromeSession {
    pub fn new(bin: &str, profile: PageProfile, page_load_timeout: Duration) -> Self {
        Self {
            bin: bin.to_string(),
            profile,
            page_load_timeout,
            page: None,
        }
    }

    async fn backoff(url: &str, attempt: u32, reason: &str) {
        let backoff = CHROME_RETRY_BASE * 3u32.pow(attempt);
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        warn!(
            url,
            attempt = attempt + 1,
            backoff_secs = backoff.as_secs(),
            reason,
            "Chrome launch failed, retrying after backoff"
        );
        tokio::time::sleep(backoff + jitter).await;
    }

    async fn dump_dom(&self, url: &str) -> Result<String, SessionError> {
        let parsed = url::Url::parse(url).map_err(|e| SessionError::Load(format!("{url}: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(SessionError::Load(format!(
                "only http/https URLs are allowed, got {}",
                parsed.scheme()
            )));
        }

        let budget_ms = self.page_load_timeout.as_millis().to_string();
        for attempt in 0..CHROME_MAX_ATTEMPTS {
            let tmp_dir = tempfile::tempdir()
                .map_err(|e| SessionError::Unavailable(format!("temp profile dir: {e}")))?;

            let result = tokio::time::timeout(
                self.page_load_timeout + CHROME_STARTUP,
                tokio::process::Command::new(&self.bin)
                    .args([
                        "--headless",
                        "--no-sandbox",
                        "--disable-gpu",
                        "--disable-dev-shm-usage",
                        &format!("--user-data-dir={}", tmp_dir.path().display()),
                        &format!("--virtual-time-budget={budget_ms}"),
                        "--dump-dom",
                        url,
                    ])
                    .kill_on_drop(true)
                    .output(),
            )
            .await;

            let last = attempt + 1 == CHROME_MAX_ATTEMPTS;
            match result {
                Ok(Ok(output)) if output.status.success() => {
                    if output.stdout.is_empty() && !last {
                        Self::backoff(url, attempt, "empty DOM").await;
                        continue;
                    }
                    return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
                }
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if is_fork_failure(&stderr) && !last {
                        Self::backoff(url, attempt, "cannot fork").await;
                        continue;
                    }
                    return Err(SessionError::Load(format!("chrome exited with error: {stderr}")));
                }
                Ok(Err(e)) => {
                    if is_fork_failure(&e.to_string()) && !last {
                        Self::backoff(url, attempt, "spawn failed").await;
                        continue;
                    }
                    return Err(SessionError::Unavailable(format!("{}: {e}", self.bin)));
                }
                Err(_) => return Err(SessionError::Timeout(url.to_string())),
            }
        }

        Err(SessionError::Unavailable(format!(
            "chrome failed {CHROME_MAX_ATTEMPTS} times for {url}"
        )))
    }
}

fn is_fork_failure(message: &str) -> bool {
    message.contains("Cannot fork") || message.contains("Resource temporarily unavailable")
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        self.page = None;
        debug!(url, session = "chrome", "Opening page");
        let html = self.dump_dom(url).await?;
        check_rendered(&self.profile, url, &html)?;
        self.page = Some(html);
        Ok(())
    }

    async fn scroll(&mut self) -> Result<ScrollProbe, SessionError> {
        let html = self.page.as_deref().ok_or_else(no_page)?;
        Ok(probe(&self.profile, html))
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        self.page.clone().ok_or_else(no_page)
    }

    fn name(&self) -> &str {
        "chrome"
    }
}

fn no_page() -> SessionError {
    SessionError::Load("no page open".to_string())
}

// --- Browserless ---

pub struct BrowserlessSession {
    client: Arc<BrowserlessClient>,
    profile: PageProfile,
    page_load_timeout: Duration,
    page: Option<String>,
}

impl BrowserlessSession {
    pub fn new(client: Arc<BrowserlessClient>, profile: PageProfile, page_load_timeout: Duration) -> Self {
        Self {
            client,
            profile,
            page_load_timeout,
            page: None,
        }
    }
}

#[async_trait]
impl BrowserSession for BrowserlessSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        self.page = None;
        debug!(url, session = "browserless", "Opening page");
        let request = ContentRequest::new(url, self.page_load_timeout).wait_for(self.profile.ready_selector);
        let html = self.client.content(&request).await.map_err(|e| {
            if e.is_transient() {
                SessionError::Timeout(format!("{url}: {e}"))
            } else {
                SessionError::Load(format!("{url}: {e}"))
            }
        })?;
        check_rendered(&self.profile, url, &html)?;
        self.page = Some(html);
        Ok(())
    }

    async fn scroll(&mut self) -> Result<ScrollProbe, SessionError> {
        let html = self.page.as_deref().ok_or_else(no_page)?;
        Ok(probe(&self.profile, html))
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        self.page.clone().ok_or_else(no_page)
    }

    fn name(&self) -> &str {
        "browserless"
    }
}

// --- Factory ---

enum Backend {
    Chrome { bin: String },
    Browserless(Arc<BrowserlessClient>),
}

/// Creates sessions for the configured backend.
pub struct BackendSessionFactory {
    backend: Backend,
    profile: PageProfile,
    page_load_timeout: Duration,
}

#[async_trait]
impl SessionFactory for BackendSessionFactory {
    async fn create(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        Ok(match &self.backend {
            Backend::Chrome { bin } => Box::new(ChromeSession::new(
                bin,
                self.profile.clone(),
                self.page_load_timeout,
            )),
            Backend::Browserless(client) => Box::new(BrowserlessSession::new(
                client.clone(),
                self.profile.clone(),
                self.page_load_timeout,
            )),
        })
    }
}

/// Session factory for the backend selected in `config`.
pub fn factory_for(config: &Config, profile: PageProfile) -> anyhow::Result<Arc<dyn SessionFactory>> {
    let backend = match &config.browser {
        BrowserBackend::Chrome { bin } => {
            info!(bin = bin.as_str(), "Using headless Chrome sessions");
            Backend::Chrome { bin: bin.clone() }
        }
        BrowserBackend::Browserless { url, token } => {
            info!(url = url.as_str(), "Using Browserless sessions");
            Backend::Browserless(Arc::new(BrowserlessClient::new(url, token.as_deref())?))
        }
    };
    Ok(Arc::new(BackendSessionFactory {
        backend,
        profile,
        page_load_timeout: config.page_load_timeout,
    }))
}
