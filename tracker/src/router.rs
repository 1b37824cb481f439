use std::future::ready;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::metrics::{setup_metrics_recorder, track_metrics};
use crate::track::{self, Tracker};

#[derive(Clone)]
pub struct State {
    pub tracker: Arc<Tracker>,
}

async fn index() -> &'static str {
    "tracker"
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub fn router(tracker: Arc<Tracker>, metrics: bool) -> Router {
    let state = State { tracker };

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/track", post(track::track))
        .route("/stats/:keyword", get(track::stats))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install the recorder unless asked to. Installing a global
    // recorder when the tracker is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
