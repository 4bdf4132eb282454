pub mod config;
pub mod error;
pub mod regions;
pub mod types;

pub use config::{BrowserBackend, Config, DelayRange, LeadPaths};
pub use error::LeadgenError;
pub use regions::*;
pub use types::*;
