use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::event::TrackerUpdate;

#[derive(Debug, Deserialize, Serialize)]
pub struct TrackRequest {
    pub keyword: String,
}

/// Everything one tracking run emitted, in merged-channel order.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct TrackResponse {
    pub keyword: String,
    pub updates: Vec<TrackerUpdate>,
}

/// On-demand snapshot of what the tracker currently knows for a keyword.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct StatsResponse {
    pub keyword: String,
    pub language_stats: HashMap<String, u64>,
    pub top_projects: Vec<String>,
}

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("keyword must not be empty")]
    EmptyKeyword,

    #[error("tracking run failed: {0}")]
    PipelineFailed(#[from] PipelineError),
}

impl IntoResponse for TrackError {
    fn into_response(self) -> Response {
        match self {
            TrackError::EmptyKeyword => (StatusCode::BAD_REQUEST, self.to_string()),
            TrackError::PipelineFailed(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}
