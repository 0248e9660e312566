//! GET /events - pipeline event stream
//!
//! Streams JobStarted, JobProgress, JobCompleted, JobFailed, ReviewQueued,
//! ReviewDecided and PersistenceCompleted; `?job_id=` restricts the stream
//! to one job.

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub job_id: Option<String>,
}

pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    cdm_common::sse::pipeline_event_stream(&state.event_bus, query.job_id)
}

pub fn event_routes() -> Router<AppState> {
    Router::new().route("/events", get(event_stream))
}
