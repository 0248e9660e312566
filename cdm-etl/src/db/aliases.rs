//! Logical job id → execution (ingestion) job id aliases

use chrono::Utc;
use sqlx::SqlitePool;
use cdm_common::{Error, Result};

/// Register or replace the alias of a logical job id
pub async fn register_alias(
    pool: &SqlitePool,
    logical_job_id: &str,
    execution_job_id: &str,
) -> Result<()> {
    if logical_job_id == execution_job_id {
        return Err(Error::InvalidInput(format!(
            "job '{}' cannot alias itself",
            logical_job_id
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO job_aliases (logical_job_id, execution_job_id, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT(logical_job_id) DO UPDATE SET
            execution_job_id = excluded.execution_job_id,
            created_at = excluded.created_at
        "#,
    )
    .bind(logical_job_id)
    .bind(execution_job_id)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Execution job id registered for a logical job id, if any
pub async fn resolve_alias(pool: &SqlitePool, logical_job_id: &str) -> Result<Option<String>> {
    let id: Option<String> =
        sqlx::query_scalar("SELECT execution_job_id FROM job_aliases WHERE logical_job_id = ?")
            .bind(logical_job_id)
            .fetch_optional(pool)
            .await?;
    Ok(id)
}
