//! # CDM Common Library
//!
//! Shared code for the clinical data model pipeline:
//! - Error and Result types
//! - TOML configuration and root folder resolution
//! - Pipeline event types and EventBus
//! - SSE streaming helper
//! - Deterministic identity hashing for surrogate keys

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod sse;

pub use error::{Error, Result};
