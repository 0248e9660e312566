//! Database access for cdm-etl
//!
//! One SQLite database holds the staging/dead-letter stores, the vocabulary,
//! concept mappings, the review queue and the standardized row store.

pub mod aliases;
pub mod cdm_rows;
pub mod concept_cache;
pub mod dead_letters;
pub mod jobs;
pub mod mappings;
pub mod resource_stores;
pub mod review_queue;
pub mod settings;
pub mod staging;
pub mod vocabulary;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "cdm.db";

/// Initialize database connection pool
///
/// Creates the database (and parent folder) if missing, then all tables.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create all pipeline tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> cdm_common::Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            state TEXT NOT NULL,
            config TEXT NOT NULL,
            received INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS staging_records (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            record_kind TEXT NOT NULL,
            resource_type TEXT,
            payload TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            status TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_staging_job ON staging_records(job_id, ingested_at)",
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            raw_payload TEXT NOT NULL,
            failure_reason TEXT NOT NULL CHECK (length(failure_reason) > 0),
            failed_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_job ON dead_letters(job_id, failed_at)",
        r#"
        CREATE TABLE IF NOT EXISTS job_aliases (
            logical_job_id TEXT PRIMARY KEY,
            execution_job_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS concepts (
            concept_id INTEGER PRIMARY KEY,
            concept_name TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            vocabulary_id TEXT NOT NULL,
            concept_code TEXT NOT NULL,
            standard_concept TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_concepts_domain_code ON concepts(domain_id, concept_code)",
        r#"
        CREATE TABLE IF NOT EXISTS concept_cache (
            system TEXT NOT NULL,
            source_value TEXT NOT NULL,
            concept_id INTEGER NOT NULL,
            concept_name TEXT NOT NULL,
            vocabulary_id TEXT NOT NULL,
            confidence REAL NOT NULL,
            origin TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (system, source_value)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS concept_mappings (
            job_id TEXT NOT NULL,
            field_path TEXT NOT NULL,
            source_value TEXT NOT NULL,
            concept_id INTEGER NOT NULL,
            concept_name TEXT NOT NULL,
            vocabulary_id TEXT NOT NULL,
            confidence REAL NOT NULL,
            resolution_tier TEXT NOT NULL,
            status TEXT NOT NULL,
            approved_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (job_id, field_path, source_value)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS review_queue (
            job_id TEXT NOT NULL,
            field_path TEXT NOT NULL,
            source_value TEXT NOT NULL,
            system TEXT NOT NULL,
            suggested TEXT NOT NULL,
            alternatives TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL,
            resolution_tier TEXT NOT NULL,
            rationale TEXT,
            status TEXT NOT NULL,
            decided_concept_id INTEGER,
            reviewed_by TEXT,
            reviewed_at TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (job_id, field_path, source_value)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cdm_rows (
            table_name TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            row_id INTEGER NOT NULL,
            person_id INTEGER NOT NULL,
            visit_occurrence_id INTEGER,
            concept_id INTEGER NOT NULL,
            field_path TEXT,
            source_value TEXT,
            row_fields TEXT NOT NULL,
            source_record_ref TEXT NOT NULL,
            job_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (table_name, natural_key)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_cdm_rows_job ON cdm_rows(job_id, table_name)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    resource_stores::create_tables(pool).await?;

    tracing::info!("Database tables initialized");

    Ok(())
}

/// Parse an RFC 3339 column value
pub(crate) fn parse_timestamp(column: &str, value: &str) -> cdm_common::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| cdm_common::Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

/// Single-connection in-memory database with all tables (unit tests)
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    init_tables(&pool).await.expect("schema");
    pool
}
