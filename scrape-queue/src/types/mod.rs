pub mod ids;
pub mod job;
pub mod profile;
pub mod events;

pub use ids::RunId;
pub use job::{Job, LeasedJob, DeadLetter, FailureRoute, FailedLease, QueueStats, Lane};
pub use profile::{DueProfile, SinceLastScrape, sort_due_profiles, STALENESS_PRIORITY_CEILING};
pub use events::JobEvent;
