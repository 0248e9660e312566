//! Test helper utilities
//!
//! Shared utilities for the cdm-etl integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod reasoning;

pub use db_utils::{build_state, concept, create_test_db, seed_vocabulary, stage_rows};
pub use reasoning::ScriptedReasoner;
