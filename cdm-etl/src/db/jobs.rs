//! Ingestion job persistence

use sqlx::{Row, SqlitePool};
use cdm_common::{Error, Result};

use super::parse_timestamp;
use crate::models::{FieldTransform, Job, JobMetrics, JobState};

/// Insert or update a job row
pub async fn save_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    let config = serde_json::to_string(&job.config)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            job_id, name, state, config, received, processed, failed,
            error, created_at, started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            state = excluded.state,
            received = excluded.received,
            processed = excluded.processed,
            failed = excluded.failed,
            error = excluded.error,
            started_at = excluded.started_at,
            ended_at = excluded.ended_at
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.name)
    .bind(job.state.as_str())
    .bind(config)
    .bind(job.metrics.received as i64)
    .bind(job.metrics.processed as i64)
    .bind(job.metrics.failed as i64)
    .bind(&job.error)
    .bind(job.created_at.to_rfc3339())
    .bind(job.started_at.map(|t| t.to_rfc3339()))
    .bind(job.ended_at.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist counters only (periodic flush during a run)
pub async fn save_metrics(pool: &SqlitePool, metrics: &JobMetrics) -> Result<()> {
    sqlx::query("UPDATE jobs SET received = ?, processed = ?, failed = ? WHERE job_id = ?")
        .bind(metrics.received as i64)
        .bind(metrics.processed as i64)
        .bind(metrics.failed as i64)
        .bind(&metrics.job_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Load job by id
pub async fn load_job(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"
        SELECT job_id, name, state, config, received, processed, failed,
               error, created_at, started_at, ended_at
        FROM jobs
        WHERE job_id = ?
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// All jobs, newest first
pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, name, state, config, received, processed, failed,
               error, created_at, started_at, ended_at
        FROM jobs
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let job_id: String = row.get("job_id");

    let state: String = row.get("state");
    let state = JobState::parse(&state)
        .ok_or_else(|| Error::Internal(format!("Unknown job state '{}'", state)))?;

    let config: String = row.get("config");
    let config: FieldTransform = serde_json::from_str(&config)?;

    let created_at: String = row.get("created_at");
    let started_at: Option<String> = row.get("started_at");
    let ended_at: Option<String> = row.get("ended_at");

    Ok(Job {
        metrics: JobMetrics {
            job_id: job_id.clone(),
            received: row.get::<i64, _>("received") as u64,
            processed: row.get::<i64, _>("processed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        },
        job_id,
        name: row.get("name"),
        state,
        config,
        error: row.get("error"),
        created_at: parse_timestamp("created_at", &created_at)?,
        started_at: started_at
            .map(|s| parse_timestamp("started_at", &s))
            .transpose()?,
        ended_at: ended_at.map(|s| parse_timestamp("ended_at", &s)).transpose()?,
    })
}
