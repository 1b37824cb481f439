use std::collections::HashMap;
use std::sync::Mutex;

use metrics::counter;

use crate::error::StageError;
use crate::event::{DiscoveryEvent, TrackerUpdate};
use crate::stages::Stage;

/// When to emit the full counter snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotMode {
    /// Once, after the current batch has been fully processed. The default.
    OnComplete,
    /// After every counted event. For upstreams that never complete, so
    /// downstream consumers are not starved waiting for a batch boundary.
    PerEvent,
}

/// Counts keyword/language occurrences across every event ever handled.
///
/// This is an occurrence counter, not a unique-repository counter: a
/// repository observed again on a later poll legitimately increments its
/// languages again. Counts only grow, and the table accumulates across
/// runs sharing this instance.
pub struct LanguageStats {
    counters: Mutex<HashMap<String, HashMap<String, u64>>>,
    mode: SnapshotMode,
}

impl LanguageStats {
    pub fn new(mode: SnapshotMode) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            mode,
        }
    }

    /// Current counts for one keyword, for on-demand serving.
    pub fn keyword_snapshot(&self, keyword: &str) -> HashMap<String, u64> {
        self.counters
            .lock()
            .map(|counters| counters.get(keyword).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Full snapshot rows, ordered by keyword then language so emission is
    /// deterministic in either mode.
    fn snapshot(&self) -> Result<Vec<TrackerUpdate>, StageError> {
        let counters = self.counters.lock()?;

        let mut rows = Vec::new();
        for (keyword, per_lang) in counters.iter() {
            for (language, count) in per_lang.iter() {
                rows.push(TrackerUpdate::LangStats {
                    keyword: keyword.clone(),
                    language: language.clone(),
                    count: *count,
                });
            }
        }
        drop(counters);

        rows.sort_by(|a, b| match (a, b) {
            (
                TrackerUpdate::LangStats {
                    keyword: ka,
                    language: la,
                    ..
                },
                TrackerUpdate::LangStats {
                    keyword: kb,
                    language: lb,
                    ..
                },
            ) => ka.cmp(kb).then_with(|| la.cmp(lb)),
            _ => std::cmp::Ordering::Equal,
        });

        Ok(rows)
    }
}

impl Default for LanguageStats {
    fn default() -> Self {
        Self::new(SnapshotMode::OnComplete)
    }
}

impl Stage for LanguageStats {
    fn name(&self) -> &'static str {
        "lang_stats"
    }

    fn on_event(&self, event: &DiscoveryEvent) -> Result<Vec<TrackerUpdate>, StageError> {
        {
            let mut counters = self.counters.lock()?;
            let per_lang = counters.entry(event.keyword.clone()).or_default();
            for language in &event.languages {
                *per_lang.entry(language.clone()).or_insert(0) += 1;
            }
        }

        counter!("tracker_language_increments_total").increment(event.languages.len() as u64);

        match self.mode {
            SnapshotMode::OnComplete => Ok(Vec::new()),
            SnapshotMode::PerEvent => self.snapshot(),
        }
    }

    fn on_complete(&self) -> Result<Vec<TrackerUpdate>, StageError> {
        match self.mode {
            SnapshotMode::OnComplete => self.snapshot(),
            // Per-event mode already emitted after the last event.
            SnapshotMode::PerEvent => Ok(Vec::new()),
        }
    }
}
