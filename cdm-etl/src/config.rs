//! Configuration resolution for cdm-etl
//!
//! Settings that may live in several places resolve with Database → ENV →
//! TOML priority. Service construction from the TOML sections lives here too.

use cdm_common::config::TomlConfig;
use cdm_common::Result;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::services::embedding::{EmbeddingBackend, HttpEmbeddingClient, TrigramEmbedder};
use crate::services::reasoning_client::{HttpReasoningClient, ReasoningRegistry, DISABLED_PROVIDER};

/// Environment variable holding the reasoning API key
pub const REASONING_API_KEY_ENV: &str = "CDM_REASONING_API_KEY";

/// Backend name used when an endpoint is configured but the provider is `disabled`
pub const DEFAULT_HTTP_PROVIDER: &str = "http";

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve the reasoning API key
///
/// **Priority:** Database → ENV → TOML. A missing key is not an error; the
/// HTTP backend then sends unauthenticated requests.
pub async fn resolve_reasoning_api_key(
    db: &Pool<Sqlite>,
    toml_config: &TomlConfig,
) -> Result<Option<String>> {
    let db_key = crate::db::settings::get_reasoning_api_key(db)
        .await?
        .filter(|k| is_valid_key(k));
    let env_key = std::env::var(REASONING_API_KEY_ENV)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = toml_config
        .reasoning
        .api_key
        .clone()
        .filter(|k| is_valid_key(k));

    let sources: Vec<&str> = [
        ("database", db_key.is_some()),
        ("environment", env_key.is_some()),
        ("TOML", toml_key.is_some()),
    ]
    .iter()
    .filter(|(_, present)| *present)
    .map(|(name, _)| *name)
    .collect();

    if sources.len() > 1 {
        warn!(
            "Reasoning API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(source) = sources.first() {
        info!("Reasoning API key loaded from {}", source);
    }

    Ok(db_key.or(env_key).or(toml_key))
}

/// Non-empty, non-whitespace
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Embedding backend from `[embedding]`
pub fn build_embedder(toml_config: &TomlConfig) -> Arc<dyn EmbeddingBackend> {
    let section = &toml_config.embedding;
    let Some(endpoint) = section.endpoint.clone() else {
        return Arc::new(TrigramEmbedder);
    };

    let model = section.model.clone().unwrap_or_default();
    match HttpEmbeddingClient::new(endpoint.clone(), model, EMBEDDING_TIMEOUT) {
        Ok(client) => {
            info!(endpoint = %endpoint, "Using HTTP embedding backend");
            Arc::new(client)
        }
        Err(e) => {
            warn!(error = %e, "HTTP embedding backend unavailable, using trigram embedder");
            Arc::new(TrigramEmbedder)
        }
    }
}

/// Reasoning backends from `[reasoning]`
///
/// The HTTP backend is registered under the configured provider name (or
/// [`DEFAULT_HTTP_PROVIDER`] when the provider is `disabled`) so that
/// individual normalization calls can still select it.
pub fn build_reasoning_registry(
    toml_config: &TomlConfig,
    api_key: Option<String>,
) -> ReasoningRegistry {
    let section = &toml_config.reasoning;
    let mut registry = ReasoningRegistry::new();

    let Some(endpoint) = section.endpoint.clone() else {
        return registry;
    };

    let name = if section.provider.eq_ignore_ascii_case(DISABLED_PROVIDER) {
        DEFAULT_HTTP_PROVIDER.to_string()
    } else {
        section.provider.clone()
    };

    match HttpReasoningClient::new(
        name.clone(),
        endpoint,
        section.model.clone(),
        api_key,
        section.timeout_ms,
        section.requests_per_second,
    ) {
        Ok(client) => {
            info!(provider = %name, "Registered reasoning backend");
            registry.register(Arc::new(client));
        }
        Err(e) => warn!(provider = %name, error = %e, "Reasoning backend unavailable"),
    }
    registry
}
