use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority ceiling for profiles that have been scraped before.
/// A profile N minutes stale gets `max(0, 300 - N)`.
pub const STALENESS_PRIORITY_CEILING: i64 = 300;

/// Time since a profile's last successful scrape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinceLastScrape {
    Never,
    Minutes(i64),
}

impl SinceLastScrape {
    /// Derive from an optional last-scraped timestamp
    pub fn from_last_scraped(last_scraped: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_scraped {
            None => Self::Never,
            Some(at) => Self::Minutes((now - at).num_minutes()),
        }
    }
}

impl fmt::Display for SinceLastScrape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Minutes(minutes) => write!(f, "{} minutes ago", minutes),
        }
    }
}

/// A tracked profile that is due for scraping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueProfile {
    pub key: String,
    pub last_scraped: Option<DateTime<Utc>>,
    pub since_last_scrape: SinceLastScrape,
}

impl DueProfile {
    pub fn new(key: impl Into<String>, last_scraped: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            last_scraped,
            since_last_scrape: SinceLastScrape::from_last_scraped(last_scraped, now),
        }
    }

    /// Queue priority derived from staleness; never-scraped profiles get 0
    pub fn scrape_priority(&self) -> i64 {
        match self.since_last_scrape {
            SinceLastScrape::Never => 0,
            SinceLastScrape::Minutes(minutes) => (STALENESS_PRIORITY_CEILING - minutes).max(0),
        }
    }
}

/// Order never-scraped profiles first, then stalest first
pub fn sort_due_profiles(profiles: &mut [DueProfile]) {
    profiles.sort_by(|a, b| match (a.last_scraped, b.last_scraped) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    });
}
