pub mod lang_stats;
pub mod new_repos;
pub mod top_ranked;

pub use lang_stats::{LanguageStats, SnapshotMode};
pub use new_repos::NewRepoFilter;
pub use top_ranked::TopRanked;

use crate::error::StageError;
use crate::event::{DiscoveryEvent, TrackerUpdate};

/// One stateful transformation over the shared event batch.
///
/// Callbacks are synchronous CPU-bound work invoked from pool workers.
/// Two events of the same run may be handled concurrently, so each
/// implementation guards its own storage with a lock scoped to the atomic
/// step its contract needs. No lock is held across I/O.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one event, returning the updates it produced in order.
    fn on_event(&self, event: &DiscoveryEvent) -> Result<Vec<TrackerUpdate>, StageError>;

    /// Called once all events of the current run have been handled.
    fn on_complete(&self) -> Result<Vec<TrackerUpdate>, StageError> {
        Ok(Vec::new())
    }
}
