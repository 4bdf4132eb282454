pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Slack added on top of the page-load budget for the HTTP round trip itself.
const REQUEST_MARGIN: Duration = Duration::from_secs(15);

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// A single `/content` render: navigate, optionally wait for a selector, dump the DOM.
#[derive(Debug, Clone)]
pub struct ContentRequest {
    pub url: String,
    pub wait_for_selector: Option<String>,
    pub timeout: Duration,
}

impl ContentRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            wait_for_selector: None,
            timeout,
        }
    }

    pub fn wait_for(mut self, selector: impl Into<String>) -> Self {
        self.wait_for_selector = Some(selector.into());
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentBody<'a> {
    url: &'a str,
    goto_options: GotoOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_selector: Option<WaitForSelector<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    timeout: u64,
    wait_until: &'static str,
}

#[derive(Serialize)]
struct WaitForSelector<'a> {
    selector: &'a str,
    timeout: u64,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}/{path}", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// Fetch fully-rendered HTML for a request via the Browserless /content endpoint.
    ///
    /// Navigation and the selector wait share `request.timeout`; Browserless reports
    /// an expired wait as status 408, surfaced here as [`BrowserlessError::Timeout`].
    pub async fn content(&self, request: &ContentRequest) -> Result<String> {
        let timeout_ms = request.timeout.as_millis() as u64;
        let body = ContentBody {
            url: &request.url,
            goto_options: GotoOptions {
                timeout: timeout_ms,
                wait_until: "networkidle2",
            },
            wait_for_selector: request
                .wait_for_selector
                .as_deref()
                .map(|selector| WaitForSelector {
                    selector,
                    timeout: timeout_ms,
                }),
        };

        debug!(url = request.url.as_str(), timeout_ms, "Browserless content request");

        let resp = self
            .client
            .post(self.endpoint("content"))
            .timeout(request.timeout + REQUEST_MARGIN)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 408 {
            return Err(BrowserlessError::Timeout(request.url.clone()));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}
