use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

use crate::error::StageError;
use crate::event::{DiscoveryEvent, TrackerUpdate};
use crate::stages::Stage;
use crate::time::TimeSource;

/// Ranks the most popular repositories for one keyword within a trailing
/// time window.
///
/// Matching events buffer until the batch completes; window membership is
/// evaluated once at ranking time, not on append. The buffer is drained by
/// every ranking, so the stage holds no state across runs.
pub struct TopRanked {
    keyword: String,
    window: Duration,
    top_n: usize,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    buffer: Mutex<Vec<DiscoveryEvent>>,
}

struct Candidate {
    repository_name: String,
    popularity_signal: u64,
    observed_at: OffsetDateTime,
}

impl TopRanked {
    pub fn new(
        keyword: &str,
        window: Duration,
        top_n: usize,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            keyword: keyword.to_owned(),
            window,
            top_n,
            timesource,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Collapse buffered events to one candidate per repository: the
    /// maximum popularity seen in the window, dated at the most recent
    /// observation achieving that maximum.
    fn candidates(&self, events: Vec<DiscoveryEvent>) -> Vec<Candidate> {
        let now = self.timesource.current_time();
        // A window too large to subtract simply covers everything.
        let window_start = now
            .checked_sub(self.window)
            .unwrap_or(time::PrimitiveDateTime::MIN.assume_utc());

        let mut per_repo: Vec<Candidate> = Vec::new();
        for event in events {
            if event.observed_at < window_start || event.observed_at > now {
                continue;
            }

            match per_repo
                .iter_mut()
                .find(|c| c.repository_name == event.repository_name)
            {
                Some(candidate) => {
                    if (event.popularity_signal, event.observed_at)
                        > (candidate.popularity_signal, candidate.observed_at)
                    {
                        candidate.popularity_signal = event.popularity_signal;
                        candidate.observed_at = event.observed_at;
                    }
                }
                None => per_repo.push(Candidate {
                    repository_name: event.repository_name,
                    popularity_signal: event.popularity_signal,
                    observed_at: event.observed_at,
                }),
            }
        }

        per_repo.sort_by(|a, b| {
            b.popularity_signal
                .cmp(&a.popularity_signal)
                .then_with(|| b.observed_at.cmp(&a.observed_at))
                .then_with(|| a.repository_name.cmp(&b.repository_name))
        });
        per_repo.truncate(self.top_n);
        per_repo
    }
}

impl Stage for TopRanked {
    fn name(&self) -> &'static str {
        "top_ranked"
    }

    fn on_event(&self, event: &DiscoveryEvent) -> Result<Vec<TrackerUpdate>, StageError> {
        if event.keyword == self.keyword {
            self.buffer.lock()?.push(event.clone());
        }

        Ok(Vec::new())
    }

    fn on_complete(&self) -> Result<Vec<TrackerUpdate>, StageError> {
        let buffered = std::mem::take(&mut *self.buffer.lock()?);

        Ok(self
            .candidates(buffered)
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| TrackerUpdate::TopRanked {
                keyword: self.keyword.clone(),
                repository_name: candidate.repository_name,
                rank: index + 1,
            })
            .collect())
    }
}
