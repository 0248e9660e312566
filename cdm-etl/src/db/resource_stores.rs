//! Resource-type-specific document stores
//!
//! Typed clinical documents written by direct feeds land in one table per
//! resource type. Persistence scans them as the last record source.

use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use cdm_common::{Error, Result};

use super::parse_timestamp;
use crate::models::{RawRecord, StagingRecord, StagingStatus};

/// (resource type, table) pairs
pub const RESOURCE_STORES: &[(&str, &str)] = &[
    ("Patient", "resource_patient"),
    ("Encounter", "resource_encounter"),
    ("Condition", "resource_condition"),
    ("Observation", "resource_observation"),
    ("MedicationRequest", "resource_medication_request"),
    ("Procedure", "resource_procedure"),
];

/// Table name for a resource type (case-insensitive)
pub fn store_for(resource_type: &str) -> Option<&'static str> {
    RESOURCE_STORES
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(resource_type))
        .map(|(_, table)| *table)
}

/// All store table names
pub fn store_names() -> Vec<String> {
    RESOURCE_STORES.iter().map(|(_, t)| t.to_string()).collect()
}

pub(crate) async fn create_tables(pool: &SqlitePool) -> Result<()> {
    for (_, table) in RESOURCE_STORES {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                stored_at TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&ddl).execute(pool).await?;

        let index = format!("CREATE INDEX IF NOT EXISTS idx_{table}_job ON {table}(job_id)");
        sqlx::query(&index).execute(pool).await?;
    }
    Ok(())
}

/// Store a typed document for a job; returns the document id
pub async fn insert_resource(pool: &SqlitePool, job_id: &str, body: &Value) -> Result<String> {
    let resource_type = body
        .get(crate::models::record::RESOURCE_TYPE_MEMBER)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidInput("document has no resourceType".to_string()))?;
    let table = store_for(resource_type).ok_or_else(|| {
        Error::InvalidInput(format!("no resource store for type '{}'", resource_type))
    })?;

    let id = uuid::Uuid::new_v4().to_string();
    let sql = format!(
        "INSERT INTO {table} (id, job_id, resource_type, payload, stored_at) VALUES (?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&id)
        .bind(job_id)
        .bind(resource_type)
        .bind(body.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

    Ok(id)
}

/// Documents of a job in one store, shaped as staging records
pub async fn find_by_job(pool: &SqlitePool, table: &str, job_id: &str) -> Result<Vec<StagingRecord>> {
    if !RESOURCE_STORES.iter().any(|(_, t)| *t == table) {
        return Err(Error::InvalidInput(format!("unknown resource store '{}'", table)));
    }

    let sql = format!(
        "SELECT id, job_id, resource_type, payload, stored_at FROM {table} WHERE job_id = ? ORDER BY stored_at, id"
    );
    let rows = sqlx::query(&sql).bind(job_id).fetch_all(pool).await?;

    rows.iter()
        .map(|row| {
            let payload: String = row.get("payload");
            let stored_at: String = row.get("stored_at");
            let body: Value = serde_json::from_str(&payload)?;
            Ok(StagingRecord {
                id: row.get("id"),
                job_id: row.get("job_id"),
                payload: RawRecord::Resource {
                    resource_type: row.get("resource_type"),
                    body,
                },
                ingested_at: parse_timestamp("stored_at", &stored_at)?,
                status: StagingStatus::Staged,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_routes_by_type() {
        let pool = crate::db::memory_pool().await;
        insert_resource(&pool, "J", &json!({"resourceType": "Condition", "id": "c1"}))
            .await
            .unwrap();

        let conditions = find_by_job(&pool, "resource_condition", "J").await.unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].payload.discriminator(), Some("Condition"));
        assert!(find_by_job(&pool, "resource_patient", "J").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_and_store_rejected() {
        let pool = crate::db::memory_pool().await;
        assert!(insert_resource(&pool, "J", &json!({"resourceType": "Binary"})).await.is_err());
        assert!(find_by_job(&pool, "staging_records", "J").await.is_err());
    }
}
