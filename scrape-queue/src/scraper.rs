//! Boundary to the component that actually fetches a profile.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ScrapeError;

/// Result of one scrape attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeReport {
    pub success: bool,
    /// Failure description when `success` is false
    pub error: Option<String>,
    pub videos: usize,
    pub musics: usize,
    pub tags: usize,
}

impl ScrapeReport {
    pub fn succeeded(videos: usize, musics: usize, tags: usize) -> Self {
        Self {
            success: true,
            error: None,
            videos,
            musics,
            tags,
        }
    }

    /// A scrape that ran but reported failure
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Message to record on the job when this report is a failure
    pub fn failure_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "Scrape reported failure".to_string())
    }
}

/// Scrapes a single profile. Implementations are shared by every worker.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape_profile(&self, key: &str) -> Result<ScrapeReport, ScrapeError>;

    /// Release per-profile resources; runs after every attempt
    async fn release(&self, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_defaults() {
        assert_eq!(ScrapeReport::failed("captcha").failure_message(), "captcha");

        let silent = ScrapeReport { success: false, ..ScrapeReport::default() };
        assert_eq!(silent.failure_message(), "Scrape reported failure");
        assert!(ScrapeReport::succeeded(12, 3, 40).success);
    }
}
