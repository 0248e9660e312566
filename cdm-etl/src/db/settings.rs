//! Settings database operations
//!
//! Key/value accessors over the `settings` table for runtime-tunable values.

use sqlx::{Pool, Sqlite};
use cdm_common::{Error, Result};

/// Reasoning backend API key
pub async fn get_reasoning_api_key(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, "reasoning_api_key").await
}

pub async fn set_reasoning_api_key(db: &Pool<Sqlite>, key: String) -> Result<()> {
    set_setting(db, "reasoning_api_key", key).await
}

/// Maximum time to retry a locked staging write
///
/// **Default:** 5000 ms
pub async fn get_max_lock_wait_ms(db: &Pool<Sqlite>, default: u64) -> Result<u64> {
    get_setting(db, "ingestion_max_lock_wait_ms")
        .await
        .map(|opt| opt.unwrap_or(default))
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting '{}' failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (upsert)
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setting_round_trip() {
        let pool = crate::db::memory_pool().await;

        assert_eq!(get_reasoning_api_key(&pool).await.unwrap(), None);
        set_reasoning_api_key(&pool, "k-1".to_string()).await.unwrap();
        set_reasoning_api_key(&pool, "k-2".to_string()).await.unwrap();
        assert_eq!(get_reasoning_api_key(&pool).await.unwrap().as_deref(), Some("k-2"));
    }

    #[tokio::test]
    async fn test_numeric_setting_default_and_parse_error() {
        let pool = crate::db::memory_pool().await;
        assert_eq!(get_max_lock_wait_ms(&pool, 5000).await.unwrap(), 5000);

        set_setting(&pool, "ingestion_max_lock_wait_ms", "soon").await.unwrap();
        assert!(get_max_lock_wait_ms(&pool, 5000).await.is_err());
    }
}
