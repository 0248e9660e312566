//! Staging store
//!
//! Append-only per job; rows are never updated once written.

use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use cdm_common::Result;

use super::parse_timestamp;
use crate::models::{RawRecord, StagingRecord, StagingStatus};

/// Insert one staging record
pub async fn insert_record(pool: &SqlitePool, record: &StagingRecord) -> Result<()> {
    let payload = serde_json::to_string(&record.payload)?;

    sqlx::query(
        r#"
        INSERT INTO staging_records (id, job_id, record_kind, resource_type, payload, ingested_at, status)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.job_id)
    .bind(record.payload.kind())
    .bind(record.payload.discriminator())
    .bind(payload)
    .bind(record.ingested_at.to_rfc3339())
    .bind(record.status.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

/// All staged records of exactly this job, oldest first
pub async fn find_by_job(pool: &SqlitePool, job_id: &str) -> Result<Vec<StagingRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, payload, ingested_at
        FROM staging_records
        WHERE job_id = ?
        ORDER BY ingested_at, id
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let payload: String = row.get("payload");
            let ingested_at: String = row.get("ingested_at");
            Ok(StagingRecord {
                id: row.get("id"),
                job_id: row.get("job_id"),
                payload: serde_json::from_str::<RawRecord>(&payload)?,
                ingested_at: parse_timestamp("ingested_at", &ingested_at)?,
                status: StagingStatus::Staged,
            })
        })
        .collect()
}

pub async fn count_by_job(pool: &SqlitePool, job_id: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staging_records WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

/// Resource-type discriminators of a job's staged records with their counts
pub async fn discriminator_counts(pool: &SqlitePool, job_id: &str) -> Result<BTreeMap<String, u64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT resource_type, COUNT(*)
        FROM staging_records
        WHERE job_id = ? AND resource_type IS NOT NULL
        GROUP BY resource_type
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(t, n)| (t, n as u64)).collect())
}

/// Union of field names across a job's staged records
pub async fn field_schema(pool: &SqlitePool, job_id: &str) -> Result<Vec<String>> {
    let names: BTreeSet<String> = find_by_job(pool, job_id)
        .await?
        .iter()
        .flat_map(|r| r.payload.field_names())
        .collect();
    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_find_filters_by_job() {
        let pool = crate::db::memory_pool().await;
        let row = RawRecord::classify(json!({"patient_id": "p1", "diagnosis_code": "E11"})).unwrap();
        let resource = RawRecord::classify(json!({"resourceType": "Condition", "id": "c1"})).unwrap();

        insert_record(&pool, &StagingRecord::new("A", row.clone())).await.unwrap();
        insert_record(&pool, &StagingRecord::new("A", resource)).await.unwrap();
        insert_record(&pool, &StagingRecord::new("other", row)).await.unwrap();

        let a = find_by_job(&pool, "A").await.unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|r| r.job_id == "A"));
        assert_eq!(count_by_job(&pool, "B").await.unwrap(), 0);

        let counts = discriminator_counts(&pool, "A").await.unwrap();
        assert_eq!(counts.get("Condition"), Some(&1));

        let schema = field_schema(&pool, "A").await.unwrap();
        assert!(schema.contains(&"diagnosis_code".to_string()));
        assert!(schema.contains(&"resourceType".to_string()));
    }
}
