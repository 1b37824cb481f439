use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::Json;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::api::{StatsResponse, TrackError, TrackRequest, TrackResponse};
use crate::config::Config;
use crate::event::TrackerUpdate;
use crate::pipeline::Pipeline;
use crate::router;
use crate::source::EventSource;
use crate::stages::{LanguageStats, NewRepoFilter, SnapshotMode, Stage, TopRanked};
use crate::time::TimeSource;

/// Capacity of the merged update channel for one run.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Long-lived tracking state shared by every run.
///
/// The dedup filter and the language counters accumulate across runs; the
/// ranking stage is built fresh per run since its window state is scoped
/// to a single batch. Rankings served over HTTP come from a memo of each
/// keyword's most recent completed run.
pub struct Tracker {
    source: Arc<dyn EventSource + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    new_repos: Arc<NewRepoFilter>,
    lang_stats: Arc<LanguageStats>,
    ranking_window: time::Duration,
    top_n: usize,
    retry_budget: u32,
    retry_backoff: std::time::Duration,
    worker_pool_size: usize,
    last_rankings: Mutex<HashMap<String, Vec<String>>>,
}

impl Tracker {
    pub fn new(
        config: &Config,
        source: Arc<dyn EventSource + Send + Sync>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        let mode = if config.snapshot_per_event {
            SnapshotMode::PerEvent
        } else {
            SnapshotMode::OnComplete
        };

        Self {
            source,
            timesource,
            new_repos: Arc::new(NewRepoFilter::new()),
            lang_stats: Arc::new(LanguageStats::new(mode)),
            ranking_window: time::Duration::try_from(config.ranking_window.0)
                .unwrap_or(time::Duration::MAX),
            top_n: config.top_n,
            retry_budget: config.retry_budget,
            retry_backoff: config.retry_backoff.0,
            worker_pool_size: config.worker_pool_size,
            last_rankings: Mutex::new(HashMap::new()),
        }
    }

    /// Run one tracking pass for `keyword` and collect the merged stream.
    pub async fn track(&self, keyword: &str) -> Result<Vec<TrackerUpdate>, TrackError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(TrackError::EmptyKeyword);
        }

        let ranking = Arc::new(TopRanked::new(
            keyword,
            self.ranking_window,
            self.top_n,
            self.timesource.clone(),
        ));
        let stages: Vec<Arc<dyn Stage>> = vec![
            self.new_repos.clone(),
            self.lang_stats.clone(),
            ranking,
        ];
        let pipeline = Pipeline::new(
            self.source.clone(),
            stages,
            self.retry_budget,
            self.retry_backoff,
            self.worker_pool_size,
        );

        let (tx, mut rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let collect = async move {
            let mut updates = Vec::new();
            while let Some(update) = rx.recv().await {
                updates.push(update);
            }
            updates
        };

        let (result, updates) = tokio::join!(pipeline.run(keyword, tx), collect);
        result?;

        self.memoize_ranking(keyword, &updates);

        Ok(updates)
    }

    /// Snapshot of the live language counters and the most recent ranking.
    pub fn stats(&self, keyword: &str) -> StatsResponse {
        let top_projects = self
            .last_rankings
            .lock()
            .map(|rankings| rankings.get(keyword).cloned().unwrap_or_default())
            .unwrap_or_default();

        StatsResponse {
            keyword: keyword.to_owned(),
            language_stats: self.lang_stats.keyword_snapshot(keyword),
            top_projects,
        }
    }

    fn memoize_ranking(&self, keyword: &str, updates: &[TrackerUpdate]) {
        let ranked: Vec<String> = updates
            .iter()
            .filter_map(|update| match update {
                TrackerUpdate::TopRanked {
                    repository_name, ..
                } => Some(repository_name.clone()),
                _ => None,
            })
            .collect();

        if let Ok(mut rankings) = self.last_rankings.lock() {
            rankings.insert(keyword.to_owned(), ranked);
        }
    }
}

#[instrument(skip_all, fields(keyword))]
pub async fn track(
    State(state): State<router::State>,
    Json(request): Json<TrackRequest>,
) -> Result<Json<TrackResponse>, TrackError> {
    tracing::Span::current().record("keyword", request.keyword.as_str());
    counter!("tracker_track_requests_total").increment(1);

    let updates = state.tracker.track(&request.keyword).await?;

    Ok(Json(TrackResponse {
        keyword: request.keyword.trim().to_owned(),
        updates,
    }))
}

#[instrument(skip_all, fields(keyword = %keyword))]
pub async fn stats(
    State(state): State<router::State>,
    Path(keyword): Path<String>,
) -> Json<StatsResponse> {
    Json(state.tracker.stats(&keyword))
}
