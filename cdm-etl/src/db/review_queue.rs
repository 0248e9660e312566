//! Review queue persistence

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqliteExecutor, SqlitePool};
use cdm_common::{Error, Result};

use super::parse_timestamp;
use crate::models::{MappingKey, ResolutionTier, ReviewQueueEntry, ReviewStatus};

const SELECT_COLUMNS: &str = r#"
    SELECT job_id, field_path, source_value, system, suggested, alternatives, confidence,
           resolution_tier, rationale, status, decided_concept_id, reviewed_by,
           reviewed_at, created_at
    FROM review_queue
"#;

/// Counts per status for one job
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewStats {
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
}

impl ReviewStats {
    pub fn total(&self) -> u64 {
        self.pending + self.approved + self.rejected
    }
}

/// Enqueue (or refresh) a pending entry
///
/// Entries that already carry a human decision are left untouched;
/// returns whether the row was written.
pub async fn upsert_pending(pool: &SqlitePool, entry: &ReviewQueueEntry) -> Result<bool> {
    let suggested = serde_json::to_string(&entry.suggested)?;
    let alternatives = serde_json::to_string(&entry.alternatives)?;

    let result = sqlx::query(
        r#"
        INSERT INTO review_queue (
            job_id, field_path, source_value, system, suggested, alternatives, confidence,
            resolution_tier, rationale, status, decided_concept_id, reviewed_by,
            reviewed_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, NULL, NULL, ?)
        ON CONFLICT(job_id, field_path, source_value) DO UPDATE SET
            system = excluded.system,
            suggested = excluded.suggested,
            alternatives = excluded.alternatives,
            confidence = excluded.confidence,
            resolution_tier = excluded.resolution_tier,
            rationale = excluded.rationale
        WHERE review_queue.status = 'pending'
        "#,
    )
    .bind(&entry.job_id)
    .bind(&entry.field_path)
    .bind(&entry.source_value)
    .bind(&entry.system)
    .bind(suggested)
    .bind(alternatives)
    .bind(entry.confidence as f64)
    .bind(entry.resolution_tier.as_str())
    .bind(&entry.rationale)
    .bind(entry.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get(pool: &SqlitePool, key: &MappingKey) -> Result<Option<ReviewQueueEntry>> {
    let sql = format!(
        "{} WHERE job_id = ? AND field_path = ? AND source_value = ?",
        SELECT_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(&key.job_id)
        .bind(&key.field_path)
        .bind(&key.source_value)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Entries of a job, optionally filtered by status (highest confidence first)
pub async fn list(
    pool: &SqlitePool,
    job_id: &str,
    status: Option<ReviewStatus>,
) -> Result<Vec<ReviewQueueEntry>> {
    let status = status.map(|s| s.as_str());
    let sql = format!(
        "{} WHERE job_id = ? AND (? IS NULL OR status = ?) \
         ORDER BY confidence DESC, field_path, source_value",
        SELECT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(job_id)
        .bind(status)
        .bind(status)
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Pending entries of a job whose confidence is at or above `floor`
pub async fn pending_at_or_above(
    pool: &SqlitePool,
    job_id: &str,
    floor: f32,
) -> Result<Vec<ReviewQueueEntry>> {
    let sql = format!(
        "{} WHERE job_id = ? AND status = 'pending' AND confidence >= ? \
         ORDER BY confidence DESC, field_path, source_value",
        SELECT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(job_id)
        .bind(floor as f64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Record a decision on an entry
///
/// Single conditional update: returns `false` when the entry already holds
/// exactly this decision (or does not exist), so repeated identical
/// decisions are no-ops.
pub async fn apply_decision<'e, E>(
    executor: E,
    key: &MappingKey,
    status: ReviewStatus,
    decided_concept_id: Option<i64>,
    reviewer: &str,
    reviewed_at: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE review_queue
        SET status = ?, decided_concept_id = ?, reviewed_by = ?, reviewed_at = ?
        WHERE job_id = ? AND field_path = ? AND source_value = ?
          AND NOT (status = ? AND decided_concept_id IS ?)
        "#,
    )
    .bind(status.as_str())
    .bind(decided_concept_id)
    .bind(reviewer)
    .bind(reviewed_at.to_rfc3339())
    .bind(&key.job_id)
    .bind(&key.field_path)
    .bind(&key.source_value)
    .bind(status.as_str())
    .bind(decided_concept_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Put a decided entry back to pending; returns whether anything changed
pub async fn reopen<'e, E>(
    executor: E,
    key: &MappingKey,
    reviewer: &str,
    at: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE review_queue
        SET status = 'pending', decided_concept_id = NULL, reviewed_by = ?, reviewed_at = ?
        WHERE job_id = ? AND field_path = ? AND source_value = ? AND status <> 'pending'
        "#,
    )
    .bind(reviewer)
    .bind(at.to_rfc3339())
    .bind(&key.job_id)
    .bind(&key.field_path)
    .bind(&key.source_value)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Drop an undecided entry; returns whether one was removed
pub async fn discard_pending(pool: &SqlitePool, key: &MappingKey) -> Result<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM review_queue
        WHERE job_id = ? AND field_path = ? AND source_value = ? AND status = 'pending'
        "#,
    )
    .bind(&key.job_id)
    .bind(&key.field_path)
    .bind(&key.source_value)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn stats(pool: &SqlitePool, job_id: &str) -> Result<ReviewStats> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM review_queue WHERE job_id = ? GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    let mut stats = ReviewStats::default();
    for row in rows {
        let status: String = row.get("status");
        let n = row.get::<i64, _>("n") as u64;
        match ReviewStatus::parse(&status) {
            Some(ReviewStatus::Pending) => stats.pending = n,
            Some(ReviewStatus::Approved) => stats.approved = n,
            Some(ReviewStatus::Rejected) => stats.rejected = n,
            None => tracing::warn!(status = %status, "Unknown review status in queue"),
        }
    }
    Ok(stats)
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ReviewQueueEntry> {
    let suggested: String = row.get("suggested");
    let alternatives: String = row.get("alternatives");
    let tier: String = row.get("resolution_tier");
    let status: String = row.get("status");
    let reviewed_at: Option<String> = row.get("reviewed_at");
    let created_at: String = row.get("created_at");

    Ok(ReviewQueueEntry {
        job_id: row.get("job_id"),
        field_path: row.get("field_path"),
        source_value: row.get("source_value"),
        system: row.get("system"),
        suggested: serde_json::from_str(&suggested)?,
        alternatives: serde_json::from_str(&alternatives)?,
        confidence: row.get::<f64, _>("confidence") as f32,
        resolution_tier: ResolutionTier::parse(&tier)
            .ok_or_else(|| Error::Internal(format!("Unknown resolution tier '{}'", tier)))?,
        rationale: row.get("rationale"),
        status: ReviewStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Unknown review status '{}'", status)))?,
        decided_concept_id: row.get("decided_concept_id"),
        reviewed_by: row.get("reviewed_by"),
        reviewed_at: reviewed_at
            .map(|s| parse_timestamp("reviewed_at", &s))
            .transpose()?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
