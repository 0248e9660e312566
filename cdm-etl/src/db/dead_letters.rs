//! Dead-letter store (append-only audit trail of failed records)

use sqlx::{Row, SqlitePool};
use cdm_common::Result;

use super::parse_timestamp;
use crate::models::DeadLetterRecord;

pub async fn insert_dead_letter(pool: &SqlitePool, record: &DeadLetterRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (id, job_id, raw_payload, failure_reason, failed_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.job_id)
    .bind(&record.raw_payload)
    .bind(&record.failure_reason)
    .bind(record.failed_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Dead letters of a job in failure order
pub async fn find_by_job(pool: &SqlitePool, job_id: &str) -> Result<Vec<DeadLetterRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, raw_payload, failure_reason, failed_at
        FROM dead_letters
        WHERE job_id = ?
        ORDER BY failed_at, id
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let failed_at: String = row.get("failed_at");
            Ok(DeadLetterRecord {
                id: row.get("id"),
                job_id: row.get("job_id"),
                raw_payload: row.get("raw_payload"),
                failure_reason: row.get("failure_reason"),
                failed_at: parse_timestamp("failed_at", &failed_at)?,
            })
        })
        .collect()
}

pub async fn count_by_job(pool: &SqlitePool, job_id: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}
