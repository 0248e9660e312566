//! Concept mapping persistence
//!
//! Unique per (job_id, field_path, source_value). Rows carrying an
//! `approved_by` are human decisions and automatic writes skip them.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use cdm_common::{Error, Result};

use super::parse_timestamp;
use crate::models::{ConceptCandidate, ConceptMapping, MappingKey, MappingStatus, ResolutionTier};

const SELECT_COLUMNS: &str = r#"
    SELECT job_id, field_path, source_value, concept_id, concept_name, vocabulary_id,
           confidence, resolution_tier, status, approved_by, created_at, updated_at
    FROM concept_mappings
"#;

pub async fn get(pool: &SqlitePool, key: &MappingKey) -> Result<Option<ConceptMapping>> {
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

    row.as_ref().map(mapping_from_row).transpose()
}

/// Mappings of a job, optionally for one field
pub async fn list_by_job(
    pool: &SqlitePool,
    job_id: &str,
    field_path: Option<&str>,
) -> Result<Vec<ConceptMapping>> {
    let sql = format!(
        "{} WHERE job_id = ? AND (? IS NULL OR field_path = ?) ORDER BY field_path, source_value",
        SELECT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(job_id)
        .bind(field_path)
        .bind(field_path)
        .fetch_all(pool)
        .await?;

    rows.iter().map(mapping_from_row).collect()
}

/// Insert or refresh an automatic mapping
///
/// Returns `false` when a human decision exists and was left untouched.
pub async fn upsert_automatic(pool: &SqlitePool, mapping: &ConceptMapping) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        INSERT INTO concept_mappings (
            job_id, field_path, source_value, concept_id, concept_name, vocabulary_id,
            confidence, resolution_tier, status, approved_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
        ON CONFLICT(job_id, field_path, source_value) DO UPDATE SET
            concept_id = excluded.concept_id,
            concept_name = excluded.concept_name,
            vocabulary_id = excluded.vocabulary_id,
            confidence = excluded.confidence,
            resolution_tier = excluded.resolution_tier,
            status = excluded.status,
            updated_at = excluded.updated_at
        WHERE concept_mappings.approved_by IS NULL
        "#,
    )
    .bind(&mapping.job_id)
    .bind(&mapping.field_path)
    .bind(&mapping.source_value)
    .bind(mapping.concept_id)
    .bind(&mapping.concept_name)
    .bind(&mapping.vocabulary_id)
    .bind(mapping.confidence as f64)
    .bind(mapping.resolution_tier.as_str())
    .bind(mapping.status.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Write a human decision through to the mapping (creates it if missing)
pub async fn write_human_decision<'e, E>(
    executor: E,
    key: &MappingKey,
    concept: &ConceptCandidate,
    confidence: f32,
    tier: ResolutionTier,
    status: MappingStatus,
    approver: &str,
    decided_at: DateTime<Utc>,
) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    let at = decided_at.to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO concept_mappings (
            job_id, field_path, source_value, concept_id, concept_name, vocabulary_id,
            confidence, resolution_tier, status, approved_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id, field_path, source_value) DO UPDATE SET
            concept_id = excluded.concept_id,
            concept_name = excluded.concept_name,
            vocabulary_id = excluded.vocabulary_id,
            confidence = excluded.confidence,
            resolution_tier = excluded.resolution_tier,
            status = excluded.status,
            approved_by = excluded.approved_by,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&key.job_id)
    .bind(&key.field_path)
    .bind(&key.source_value)
    .bind(concept.concept_id)
    .bind(&concept.concept_name)
    .bind(&concept.vocabulary_id)
    .bind(confidence as f64)
    .bind(tier.as_str())
    .bind(status.as_str())
    .bind(approver)
    .bind(&at)
    .bind(&at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Return a decided mapping to pending review (explicit reopen)
pub async fn reopen<'e, E>(executor: E, key: &MappingKey, at: DateTime<Utc>) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE concept_mappings
        SET status = 'pending_review', approved_by = NULL, updated_at = ?
        WHERE job_id = ? AND field_path = ? AND source_value = ?
        "#,
    )
    .bind(at.to_rfc3339())
    .bind(&key.job_id)
    .bind(&key.field_path)
    .bind(&key.source_value)
    .execute(executor)
    .await?;

    Ok(())
}

fn mapping_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConceptMapping> {
    let tier: String = row.get("resolution_tier");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(ConceptMapping {
        job_id: row.get("job_id"),
        field_path: row.get("field_path"),
        source_value: row.get("source_value"),
        concept_id: row.get("concept_id"),
        concept_name: row.get("concept_name"),
        vocabulary_id: row.get("vocabulary_id"),
        confidence: row.get::<f64, _>("confidence") as f32,
        resolution_tier: ResolutionTier::parse(&tier)
            .ok_or_else(|| Error::Internal(format!("Unknown resolution tier '{}'", tier)))?,
        status: MappingStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Unknown mapping status '{}'", status)))?,
        approved_by: row.get("approved_by"),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
