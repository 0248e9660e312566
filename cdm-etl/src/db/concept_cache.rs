//! Concept resolution cache
//!
//! Shared across jobs; last writer wins except that automatic writes never
//! replace an entry that came from a human decision.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use cdm_common::{Error, Result};

use super::parse_timestamp;
use crate::models::{CacheEntry, CacheOrigin, ConceptCandidate};

pub async fn get(pool: &SqlitePool, system: &str, source_value: &str) -> Result<Option<CacheEntry>> {
    let row = sqlx::query(
        r#"
        SELECT system, source_value, concept_id, concept_name, vocabulary_id,
               confidence, origin, updated_at
        FROM concept_cache
        WHERE system = ? AND source_value = ?
        "#,
    )
    .bind(system)
    .bind(source_value)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let origin: String = row.get("origin");
    let updated_at: String = row.get("updated_at");
    Ok(Some(CacheEntry {
        system: row.get("system"),
        source_value: row.get("source_value"),
        concept_id: row.get("concept_id"),
        concept_name: row.get("concept_name"),
        vocabulary_id: row.get("vocabulary_id"),
        confidence: row.get::<f64, _>("confidence") as f32,
        origin: CacheOrigin::parse(&origin)
            .ok_or_else(|| Error::Internal(format!("Unknown cache origin '{}'", origin)))?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    }))
}

/// Cache an automatic resolution
///
/// Returns `false` when a human-origin entry already exists and was kept.
pub async fn put_automatic(
    pool: &SqlitePool,
    system: &str,
    source_value: &str,
    concept: &ConceptCandidate,
    confidence: f32,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO concept_cache
            (system, source_value, concept_id, concept_name, vocabulary_id, confidence, origin, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 'automatic', ?)
        ON CONFLICT(system, source_value) DO UPDATE SET
            concept_id = excluded.concept_id,
            concept_name = excluded.concept_name,
            vocabulary_id = excluded.vocabulary_id,
            confidence = excluded.confidence,
            origin = excluded.origin,
            updated_at = excluded.updated_at
        WHERE concept_cache.origin <> 'human'
        "#,
    )
    .bind(system)
    .bind(source_value)
    .bind(concept.concept_id)
    .bind(&concept.concept_name)
    .bind(&concept.vocabulary_id)
    .bind(confidence as f64)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Cache a human decision (always wins)
pub async fn put_human(
    pool: &SqlitePool,
    system: &str,
    source_value: &str,
    concept: &ConceptCandidate,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO concept_cache
            (system, source_value, concept_id, concept_name, vocabulary_id, confidence, origin, updated_at)
        VALUES (?, ?, ?, ?, ?, 1.0, 'human', ?)
        ON CONFLICT(system, source_value) DO UPDATE SET
            concept_id = excluded.concept_id,
            concept_name = excluded.concept_name,
            vocabulary_id = excluded.vocabulary_id,
            confidence = excluded.confidence,
            origin = excluded.origin,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(system)
    .bind(source_value)
    .bind(concept.concept_id)
    .bind(&concept.concept_name)
    .bind(&concept.vocabulary_id)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop a cache entry (used when a human rejects a mapping)
pub async fn remove(pool: &SqlitePool, system: &str, source_value: &str) -> Result<()> {
    sqlx::query("DELETE FROM concept_cache WHERE system = ? AND source_value = ?")
        .bind(system)
        .bind(source_value)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64) -> ConceptCandidate {
        ConceptCandidate {
            concept_id: id,
            concept_name: format!("concept {}", id),
            vocabulary_id: "SNOMED".to_string(),
            score: 1.0,
        }
    }

    #[tokio::test]
    async fn test_automatic_last_writer_wins() {
        let pool = crate::db::memory_pool().await;
        assert!(put_automatic(&pool, "ICD10", "E11", &candidate(1), 0.95).await.unwrap());
        assert!(put_automatic(&pool, "ICD10", "E11", &candidate(2), 0.92).await.unwrap());

        let entry = get(&pool, "ICD10", "E11").await.unwrap().unwrap();
        assert_eq!(entry.concept_id, 2);
        assert_eq!(entry.origin, CacheOrigin::Automatic);
    }

    #[tokio::test]
    async fn test_human_entry_never_overwritten_by_automatic() {
        let pool = crate::db::memory_pool().await;
        put_human(&pool, "ICD10", "E11", &candidate(7)).await.unwrap();

        let written = put_automatic(&pool, "ICD10", "E11", &candidate(8), 0.99).await.unwrap();
        assert!(!written);

        let entry = get(&pool, "ICD10", "E11").await.unwrap().unwrap();
        assert_eq!(entry.concept_id, 7);
        assert_eq!(entry.origin, CacheOrigin::Human);
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = crate::db::memory_pool().await;
        put_human(&pool, "s", "v", &candidate(3)).await.unwrap();
        remove(&pool, "s", "v").await.unwrap();
        assert!(get(&pool, "s", "v").await.unwrap().is_none());
    }
}
