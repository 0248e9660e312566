//! Vocabulary store (read side)
//!
//! Loading the vocabulary is done elsewhere; `insert_concepts` exists for
//! fixtures and small local vocabularies.

use sqlx::{Row, SqlitePool};
use cdm_common::Result;

use crate::models::Concept;

/// Insert or replace concepts
pub async fn insert_concepts(pool: &SqlitePool, concepts: &[Concept]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for concept in concepts {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO concepts
                (concept_id, concept_name, domain_id, vocabulary_id, concept_code, standard_concept)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(concept.concept_id)
        .bind(&concept.concept_name)
        .bind(&concept.domain_id)
        .bind(&concept.vocabulary_id)
        .bind(&concept.concept_code)
        .bind(&concept.standard_concept)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Exact code lookup within a domain, standard concepts preferred
pub async fn lookup_code(pool: &SqlitePool, domain: &str, code: &str) -> Result<Option<Concept>> {
    let row = sqlx::query(
        r#"
        SELECT concept_id, concept_name, domain_id, vocabulary_id, concept_code, standard_concept
        FROM concepts
        WHERE domain_id = ? AND concept_code = ?
        ORDER BY CASE WHEN standard_concept = 'S' THEN 0 ELSE 1 END, concept_id
        LIMIT 1
        "#,
    )
    .bind(domain)
    .bind(code.trim())
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(concept_from_row))
}

/// Concept by id, optionally restricted to a domain
pub async fn get_concept(pool: &SqlitePool, concept_id: i64, domain: Option<&str>) -> Result<Option<Concept>> {
    let row = sqlx::query(
        r#"
        SELECT concept_id, concept_name, domain_id, vocabulary_id, concept_code, standard_concept
        FROM concepts
        WHERE concept_id = ? AND (? IS NULL OR domain_id = ?)
        "#,
    )
    .bind(concept_id)
    .bind(domain)
    .bind(domain)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(concept_from_row))
}

/// Standard concepts of a domain (semantic-tier candidates)
pub async fn standard_concepts_in_domain(pool: &SqlitePool, domain: &str) -> Result<Vec<Concept>> {
    let rows = sqlx::query(
        r#"
        SELECT concept_id, concept_name, domain_id, vocabulary_id, concept_code, standard_concept
        FROM concepts
        WHERE domain_id = ? AND standard_concept = 'S'
        ORDER BY concept_id
        "#,
    )
    .bind(domain)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(concept_from_row).collect())
}

fn concept_from_row(row: &sqlx::sqlite::SqliteRow) -> Concept {
    Concept {
        concept_id: row.get("concept_id"),
        concept_name: row.get("concept_name"),
        domain_id: row.get("domain_id"),
        vocabulary_id: row.get("vocabulary_id"),
        concept_code: row.get("concept_code"),
        standard_concept: row.get("standard_concept"),
    }
}

#[cfg(test)]
pub(crate) fn concept(id: i64, name: &str, domain: &str, vocab: &str, code: &str) -> Concept {
    Concept {
        concept_id: id,
        concept_name: name.to_string(),
        domain_id: domain.to_string(),
        vocabulary_id: vocab.to_string(),
        concept_code: code.to_string(),
        standard_concept: Some("S".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_prefers_standard() {
        let pool = crate::db::memory_pool().await;
        let mut non_standard = concept(10, "Old diabetes", "Condition", "ICD10CM", "E11");
        non_standard.standard_concept = None;
        insert_concepts(
            &pool,
            &[non_standard, concept(201826, "Type 2 diabetes mellitus", "Condition", "SNOMED", "E11")],
        )
        .await
        .unwrap();

        let hit = lookup_code(&pool, "Condition", " E11 ").await.unwrap().unwrap();
        assert_eq!(hit.concept_id, 201826);
        assert!(lookup_code(&pool, "Drug", "E11").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_domain_filters() {
        let pool = crate::db::memory_pool().await;
        insert_concepts(&pool, &[concept(1, "Aspirin", "Drug", "RxNorm", "1191")])
            .await
            .unwrap();

        assert!(get_concept(&pool, 1, Some("Drug")).await.unwrap().is_some());
        assert!(get_concept(&pool, 1, Some("Condition")).await.unwrap().is_none());
        assert!(get_concept(&pool, 1, None).await.unwrap().is_some());
        assert_eq!(standard_concepts_in_domain(&pool, "Drug").await.unwrap().len(), 1);
    }
}
