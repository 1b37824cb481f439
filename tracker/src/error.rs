use thiserror::Error;

/// Enumeration of errors raised while fetching a batch of discovery events.
/// All variants are treated as transient by the pipeline and retried.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("error parsing the search API url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("search request could not be delivered: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("search API answered with status {0}")]
    UnexpectedStatus(http::StatusCode),
    #[error("failed to decode search API payload: {0}")]
    DecodingError(#[from] serde_json::Error),
}

/// Enumeration of errors raised inside a stage while handling one event.
/// A stage fault is isolated to that event and reported, never propagated
/// to sibling events or sibling stages.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("stage storage lock was poisoned by a panicking worker")]
    PoisonedLock,
}

impl<T> From<std::sync::PoisonError<T>> for StageError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StageError::PoisonedLock
    }
}

/// Enumeration of terminal errors for one pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("event source failed {attempts} consecutive attempts: {last}")]
    RetriesExhausted { attempts: u32, last: SourceError },
}
