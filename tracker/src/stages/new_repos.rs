use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use metrics::counter;

use crate::error::StageError;
use crate::event::{DiscoveryEvent, TrackerUpdate};
use crate::stages::Stage;

/// Emits `(keyword, repository_name)` the first time a repository shows up
/// for a keyword, then never again for the lifetime of the filter.
///
/// The seen-set grows monotonically and is never evicted. Check-and-insert
/// happens under one lock acquisition, so two workers racing on the same
/// pair resolve to exactly one emission.
#[derive(Default)]
pub struct NewRepoFilter {
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl NewRepoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct repositories seen for a keyword so far.
    pub fn seen_count(&self, keyword: &str) -> usize {
        self.seen
            .lock()
            .map(|seen| seen.get(keyword).map_or(0, HashSet::len))
            .unwrap_or(0)
    }
}

impl Stage for NewRepoFilter {
    fn name(&self) -> &'static str {
        "new_repos"
    }

    fn on_event(&self, event: &DiscoveryEvent) -> Result<Vec<TrackerUpdate>, StageError> {
        let first_sighting = {
            let mut seen = self.seen.lock()?;
            seen.entry(event.keyword.clone())
                .or_default()
                .insert(event.repository_name.clone())
        };

        if !first_sighting {
            return Ok(Vec::new());
        }

        counter!("tracker_new_repos_total").increment(1);

        Ok(vec![TrackerUpdate::NewRepo {
            keyword: event.keyword.clone(),
            repository_name: event.repository_name.clone(),
        }])
    }
}
