//! HTTP API handlers for cdm-etl
//!
//! REST endpoints over the pipeline services plus an SSE event stream.

pub mod health;
pub mod jobs;
pub mod normalization;
pub mod persistence;
pub mod review;
pub mod sse;

pub use health::health_routes;
pub use jobs::job_routes;
pub use normalization::normalization_routes;
pub use persistence::persistence_routes;
pub use review::review_routes;
pub use sse::event_routes;
