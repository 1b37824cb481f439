use std::sync::Arc;

use metrics::counter;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::PipelineError;
use crate::event::{DiscoveryEvent, TrackerUpdate};
use crate::source::EventSource;
use crate::stages::Stage;

/// Fans one upstream fetch out to every configured stage and merges their
/// emissions into a single downstream channel.
///
/// The source is queried at most once per run (plus retries); the fetched
/// batch is shared read-only, so no stage can trigger a second fetch.
/// Per-(stage, event) work runs on a bounded worker pool, and a fault in
/// one invocation is reported and dropped without touching sibling events
/// or sibling stages.
pub struct Pipeline {
    source: Arc<dyn EventSource + Send + Sync>,
    stages: Vec<Arc<dyn Stage>>,
    retry_budget: u32,
    retry_backoff: std::time::Duration,
    worker_pool_size: usize,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn EventSource + Send + Sync>,
        stages: Vec<Arc<dyn Stage>>,
        retry_budget: u32,
        retry_backoff: std::time::Duration,
        worker_pool_size: usize,
    ) -> Self {
        Self {
            source,
            stages,
            // A budget below one would never fetch at all.
            retry_budget: retry_budget.max(1),
            retry_backoff,
            worker_pool_size: worker_pool_size.max(1),
        }
    }

    /// Run one tracking pass for `keyword`, delivering merged stage output
    /// to `updates` until the batch is fully processed.
    ///
    /// The consumer cancels by dropping the receiving half: dispatch stops,
    /// an in-progress retry loop is released, and `run` returns `Ok`.
    /// Emission order is only guaranteed within a single stage's output;
    /// stages interleave freely on the shared channel.
    pub async fn run(
        &self,
        keyword: &str,
        updates: mpsc::Sender<TrackerUpdate>,
    ) -> Result<(), PipelineError> {
        let batch: Arc<[DiscoveryEvent]> = match self.fetch_with_retry(keyword, &updates).await? {
            Some(events) => Arc::from(events),
            None => return Ok(()), // consumer went away mid-retry
        };

        counter!("tracker_events_fetched_total").increment(batch.len() as u64);

        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size));

        let mut stage_set = JoinSet::new();
        for stage in &self.stages {
            stage_set.spawn(run_stage(
                stage.clone(),
                batch.clone(),
                updates.clone(),
                semaphore.clone(),
            ));
        }
        while (stage_set.join_next().await).is_some() {}

        counter!("tracker_runs_total").increment(1);

        Ok(())
    }

    /// Query the source, retrying sequentially until it yields a batch or
    /// the budget is spent. Returns `None` when the consumer cancelled
    /// while we were still trying.
    async fn fetch_with_retry(
        &self,
        keyword: &str,
        updates: &mpsc::Sender<TrackerUpdate>,
    ) -> Result<Option<Vec<DiscoveryEvent>>, PipelineError> {
        let mut last_error = None;

        for attempt in 1..=self.retry_budget {
            if updates.is_closed() {
                debug!(keyword, "consumer cancelled during retry loop");
                return Ok(None);
            }

            counter!("tracker_source_fetch_attempts_total").increment(1);

            match self.source.fetch(keyword).await {
                Ok(events) => {
                    debug!(keyword, events = events.len(), attempt, "fetched batch");
                    return Ok(Some(events));
                }
                Err(e) => {
                    counter!("tracker_source_fetch_failures_total").increment(1);
                    warn!(keyword, attempt, budget = self.retry_budget, "fetch failed: {}", e);
                    last_error = Some(e);
                }
            }

            if !self.retry_backoff.is_zero() && attempt < self.retry_budget {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        Err(PipelineError::RetriesExhausted {
            attempts: self.retry_budget,
            last: last_error.expect("at least one attempt was made"),
        })
    }
}

/// Feed every event of the shared batch through one stage on the worker
/// pool, then run its completion hook.
async fn run_stage(
    stage: Arc<dyn Stage>,
    batch: Arc<[DiscoveryEvent]>,
    updates: mpsc::Sender<TrackerUpdate>,
    semaphore: Arc<Semaphore>,
) {
    let mut event_set = JoinSet::new();

    for index in 0..batch.len() {
        if updates.is_closed() {
            debug!(stage = stage.name(), "consumer cancelled, dispatch stopped");
            break;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore has been closed");

        let stage = stage.clone();
        let batch = batch.clone();
        let updates = updates.clone();
        event_set.spawn(async move {
            let result = stage.on_event(&batch[index]);
            drop(permit);

            match result {
                Ok(emitted) => deliver(&updates, emitted).await,
                Err(e) => report_stage_fault(stage.name(), &batch[index], e),
            }
        });
    }
    while (event_set.join_next().await).is_some() {}

    if updates.is_closed() {
        return;
    }

    match stage.on_complete() {
        Ok(emitted) => deliver(&updates, emitted).await,
        Err(e) => {
            counter!("tracker_stage_faults_total", "stage" => stage.name()).increment(1);
            error!(stage = stage.name(), "completion hook failed: {}", e);
        }
    }
}

async fn deliver(updates: &mpsc::Sender<TrackerUpdate>, emitted: Vec<TrackerUpdate>) {
    for update in emitted {
        if updates.send(update).await.is_err() {
            // Receiver dropped; remaining emissions are discarded.
            return;
        }
        counter!("tracker_updates_emitted_total").increment(1);
    }
}

fn report_stage_fault(stage: &'static str, event: &DiscoveryEvent, error: crate::error::StageError) {
    counter!("tracker_stage_faults_total", "stage" => stage).increment(1);
    error!(stage, event = %event.key(), "event processing failed: {}", error);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::Pipeline;
    use crate::error::{PipelineError, SourceError, StageError};
    use crate::event::{DiscoveryEvent, TrackerUpdate};
    use crate::source::EventSource;
    use crate::stages::{LanguageStats, NewRepoFilter, Stage, TopRanked};
    use crate::time::FixedTime;

    const NOW: time::OffsetDateTime = time::macros::datetime!(2024-03-02 00:00:00 UTC);

    fn event(repo: &str, languages: &[&str]) -> DiscoveryEvent {
        DiscoveryEvent {
            repository_name: repo.to_string(),
            keyword: "k1".to_string(),
            observed_at: NOW,
            popularity_signal: 1,
            languages: languages.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// Source double that counts fetches and then yields a fixed batch.
    struct CountingSource {
        fetches: AtomicU32,
        batch: Vec<DiscoveryEvent>,
    }

    impl CountingSource {
        fn new(batch: Vec<DiscoveryEvent>) -> Self {
            Self {
                fetches: AtomicU32::new(0),
                batch,
            }
        }
    }

    #[async_trait]
    impl EventSource for CountingSource {
        async fn fetch(&self, _keyword: &str) -> Result<Vec<DiscoveryEvent>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.batch.clone())
        }
    }

    /// Source double that fails every attempt.
    struct FailingSource {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl EventSource for FailingSource {
        async fn fetch(&self, _keyword: &str) -> Result<Vec<DiscoveryEvent>, SourceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::UnexpectedStatus(
                http::StatusCode::SERVICE_UNAVAILABLE,
            ))
        }
    }

    /// Stage double that faults on one marked repository.
    struct FaultyStage {
        poison_repo: &'static str,
        handled: Mutex<Vec<String>>,
    }

    impl Stage for FaultyStage {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn on_event(&self, event: &DiscoveryEvent) -> Result<Vec<TrackerUpdate>, StageError> {
            if event.repository_name == self.poison_repo {
                return Err(StageError::PoisonedLock);
            }
            self.handled.lock().unwrap().push(event.repository_name.clone());
            Ok(vec![TrackerUpdate::NewRepo {
                keyword: event.keyword.clone(),
                repository_name: event.repository_name.clone(),
            }])
        }
    }

    fn three_stages() -> Vec<Arc<dyn Stage>> {
        let timesource = Arc::new(FixedTime { time: NOW });
        vec![
            Arc::new(NewRepoFilter::new()),
            Arc::new(LanguageStats::default()),
            Arc::new(TopRanked::new(
                "k1",
                time::Duration::hours(24),
                5,
                timesource,
            )),
        ]
    }

    async fn collect(
        pipeline: &Pipeline,
        keyword: &str,
    ) -> (Result<(), PipelineError>, Vec<TrackerUpdate>) {
        let (tx, mut rx) = mpsc::channel(64);
        let collector = tokio::spawn(async move {
            let mut updates = Vec::new();
            while let Some(update) = rx.recv().await {
                updates.push(update);
            }
            updates
        });

        let result = pipeline.run(keyword, tx).await;
        let updates = collector.await.unwrap();
        (result, updates)
    }

    #[tokio::test]
    async fn fetches_once_for_all_three_stages() {
        let source = Arc::new(CountingSource::new(vec![
            event("r1", &["Rust"]),
            event("r2", &["Go"]),
        ]));
        let pipeline = Pipeline::new(
            source.clone(),
            three_stages(),
            5,
            std::time::Duration::ZERO,
            10,
        );

        let (result, updates) = collect(&pipeline, "k1").await;

        assert!(result.is_ok());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let new_repos = updates
            .iter()
            .filter(|u| matches!(u, TrackerUpdate::NewRepo { .. }))
            .count();
        let lang_rows = updates
            .iter()
            .filter(|u| matches!(u, TrackerUpdate::LangStats { .. }))
            .count();
        let ranked = updates
            .iter()
            .filter(|u| matches!(u, TrackerUpdate::TopRanked { .. }))
            .count();
        assert_eq!((new_repos, lang_rows, ranked), (2, 2, 2));
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_once_with_zero_emissions() {
        let source = Arc::new(FailingSource {
            attempts: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(
            source.clone(),
            three_stages(),
            5,
            std::time::Duration::ZERO,
            10,
        );

        let (result, updates) = collect(&pipeline, "k1").await;

        match result {
            Err(PipelineError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected retry exhaustion, got {:?}", other),
        }
        assert_eq!(source.attempts.load(Ordering::SeqCst), 5);
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn source_recovers_within_budget() {
        struct FlakySource {
            attempts: AtomicU32,
        }

        #[async_trait]
        impl EventSource for FlakySource {
            async fn fetch(&self, _keyword: &str) -> Result<Vec<DiscoveryEvent>, SourceError> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(SourceError::UnexpectedStatus(
                        http::StatusCode::BAD_GATEWAY,
                    ));
                }
                Ok(vec![event("r1", &[])])
            }
        }

        let source = Arc::new(FlakySource {
            attempts: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(
            source.clone(),
            vec![Arc::new(NewRepoFilter::new())],
            5,
            std::time::Duration::ZERO,
            10,
        );

        let (result, updates) = collect(&pipeline, "k1").await;

        assert!(result.is_ok());
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn stage_fault_is_isolated_to_the_event() {
        let faulty = Arc::new(FaultyStage {
            poison_repo: "r2",
            handled: Mutex::new(Vec::new()),
        });
        let source = Arc::new(CountingSource::new(vec![
            event("r1", &[]),
            event("r2", &[]),
            event("r3", &[]),
        ]));
        let healthy = Arc::new(NewRepoFilter::new());
        let stages: Vec<Arc<dyn Stage>> = vec![faulty.clone(), healthy.clone()];
        let pipeline = Pipeline::new(source, stages, 1, std::time::Duration::ZERO, 10);

        let (result, updates) = collect(&pipeline, "k1").await;

        assert!(result.is_ok());

        // The faulty stage still processed its other events.
        let mut handled = faulty.handled.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec!["r1".to_string(), "r3".to_string()]);

        // The sibling stage saw the whole batch, poisoned event included.
        assert_eq!(healthy.seen_count("k1"), 3);
        let sibling_emissions = updates
            .iter()
            .filter(|u| matches!(u, TrackerUpdate::NewRepo { .. }))
            .count();
        assert_eq!(sibling_emissions, 5);
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_the_run() {
        let source = Arc::new(CountingSource::new(
            (0..32).map(|i| event(&format!("r{i}"), &[])).collect(),
        ));
        let pipeline = Pipeline::new(
            source,
            three_stages(),
            5,
            std::time::Duration::ZERO,
            2,
        );

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        // No hang, no error: the run notices the closed channel and stops.
        assert!(pipeline.run("k1", tx).await.is_ok());
    }

    #[tokio::test]
    async fn cancellation_releases_the_retry_loop() {
        let source = Arc::new(FailingSource {
            attempts: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(
            source.clone(),
            three_stages(),
            u32::MAX,
            std::time::Duration::from_millis(10),
            10,
        );

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            drop(rx);
        });

        let result = pipeline.run("k1", tx).await;
        handle.await.unwrap();

        assert!(result.is_ok());
        assert!(source.attempts.load(Ordering::SeqCst) < 100);
    }
}
