//! Standardized row store
//!
//! Rows are keyed by (table, natural key). Writes are upserts so persistence
//! can be re-run any number of times.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use cdm_common::{Error, Result};

use crate::models::{CdmTable, StandardizedRow};

/// Outcome counts of one upsert batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
    /// Rows already present with identical content
    pub skipped: u64,
}

/// Upsert a batch of rows in a single transaction
pub async fn upsert_rows(pool: &SqlitePool, job_id: &str, rows: &[StandardizedRow]) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    for row in rows {
        let row_fields = serde_json::to_string(&row.row_fields)?;

        let existing = sqlx::query(
            r#"
            SELECT row_id, person_id, visit_occurrence_id, concept_id, field_path,
                   source_value, row_fields, source_record_ref
            FROM cdm_rows
            WHERE table_name = ? AND natural_key = ?
            "#,
        )
        .bind(row.table.as_str())
        .bind(&row.natural_key)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO cdm_rows (
                        table_name, natural_key, row_id, person_id, visit_occurrence_id,
                        concept_id, field_path, source_value, row_fields, source_record_ref,
                        job_id, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(row.table.as_str())
                .bind(&row.natural_key)
                .bind(row.row_id)
                .bind(row.person_id)
                .bind(row.visit_occurrence_id)
                .bind(row.concept_id)
                .bind(&row.field_path)
                .bind(&row.source_value)
                .bind(&row_fields)
                .bind(&row.source_record_ref)
                .bind(job_id)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                counts.inserted += 1;
            }
            Some(current) => {
                let unchanged = current.get::<i64, _>("row_id") == row.row_id
                    && current.get::<i64, _>("person_id") == row.person_id
                    && current.get::<Option<i64>, _>("visit_occurrence_id") == row.visit_occurrence_id
                    && current.get::<i64, _>("concept_id") == row.concept_id
                    && current.get::<Option<String>, _>("field_path") == row.field_path
                    && current.get::<Option<String>, _>("source_value") == row.source_value
                    && current.get::<String, _>("row_fields") == row_fields
                    && current.get::<String, _>("source_record_ref") == row.source_record_ref;

                if unchanged {
                    counts.skipped += 1;
                    continue;
                }

                sqlx::query(
                    r#"
                    UPDATE cdm_rows
                    SET row_id = ?, person_id = ?, visit_occurrence_id = ?, concept_id = ?,
                        field_path = ?, source_value = ?, row_fields = ?, source_record_ref = ?,
                        job_id = ?, updated_at = ?
                    WHERE table_name = ? AND natural_key = ?
                    "#,
                )
                .bind(row.row_id)
                .bind(row.person_id)
                .bind(row.visit_occurrence_id)
                .bind(row.concept_id)
                .bind(&row.field_path)
                .bind(&row.source_value)
                .bind(&row_fields)
                .bind(&row.source_record_ref)
                .bind(job_id)
                .bind(&now)
                .bind(row.table.as_str())
                .bind(&row.natural_key)
                .execute(&mut *tx)
                .await?;
                counts.updated += 1;
            }
        }
    }

    tx.commit().await?;
    Ok(counts)
}

/// Rows written by a job into one table
pub async fn list_by_job(pool: &SqlitePool, job_id: &str, table: CdmTable) -> Result<Vec<StandardizedRow>> {
    let rows = sqlx::query(
        r#"
        SELECT table_name, natural_key, row_id, person_id, visit_occurrence_id, concept_id,
               field_path, source_value, row_fields, source_record_ref
        FROM cdm_rows
        WHERE job_id = ? AND table_name = ?
        ORDER BY natural_key
        "#,
    )
    .bind(job_id)
    .bind(table.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let table_name: String = row.get("table_name");
            let row_fields: String = row.get("row_fields");
            Ok(StandardizedRow {
                table: table_name.parse::<CdmTable>().map_err(Error::Internal)?,
                natural_key: row.get("natural_key"),
                row_id: row.get("row_id"),
                person_id: row.get("person_id"),
                visit_occurrence_id: row.get("visit_occurrence_id"),
                concept_id: row.get("concept_id"),
                field_path: row.get("field_path"),
                source_value: row.get("source_value"),
                row_fields: serde_json::from_str(&row_fields)?,
                source_record_ref: row.get("source_record_ref"),
            })
        })
        .collect()
}

/// Total rows in a table (all jobs)
pub async fn count_table(pool: &SqlitePool, table: CdmTable) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cdm_rows WHERE table_name = ?")
        .bind(table.as_str())
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str, concept_id: i64) -> StandardizedRow {
        let mut fields = serde_json::Map::new();
        fields.insert("condition_start_date".to_string(), json!("2024-01-05"));
        StandardizedRow {
            table: CdmTable::ConditionOccurrence,
            natural_key: key.to_string(),
            row_id: 100,
            person_id: 7,
            visit_occurrence_id: None,
            concept_id,
            field_path: Some("diagnosis_code".to_string()),
            source_value: Some("E11".to_string()),
            row_fields: fields,
            source_record_ref: "stg-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_skip_update() {
        let pool = crate::db::memory_pool().await;

        let first = upsert_rows(&pool, "J", &[row("k1", 1), row("k2", 1)]).await.unwrap();
        assert_eq!(first, UpsertCounts { inserted: 2, updated: 0, skipped: 0 });

        let again = upsert_rows(&pool, "J", &[row("k1", 1), row("k2", 1)]).await.unwrap();
        assert_eq!(again, UpsertCounts { inserted: 0, updated: 0, skipped: 2 });

        let changed = upsert_rows(&pool, "J", &[row("k1", 2)]).await.unwrap();
        assert_eq!(changed, UpsertCounts { inserted: 0, updated: 1, skipped: 0 });

        let stored = list_by_job(&pool, "J", CdmTable::ConditionOccurrence).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].concept_id, 2);
        assert_eq!(count_table(&pool, CdmTable::ConditionOccurrence).await.unwrap(), 2);
        assert_eq!(count_table(&pool, CdmTable::Person).await.unwrap(), 0);
    }
}
