use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserlessError>;

#[derive(Debug, Error)]
pub enum BrowserlessError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl BrowserlessError {
    /// Timeouts and rate limiting clear up on a fresh session; everything else
    /// is treated as a hard failure for the request that produced it.
    pub fn is_transient(&self) -> bool {
        match self {
            BrowserlessError::Timeout(_) => true,
            BrowserlessError::Api { status, .. } => *status == 408 || *status == 429,
            BrowserlessError::Network(_) => false,
        }
    }
}

impl From<reqwest::Error> for BrowserlessError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrowserlessError::Timeout(
                err.url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "response".to_string()),
            )
        } else {
            BrowserlessError::Network(err.to_string())
        }
    }
}
