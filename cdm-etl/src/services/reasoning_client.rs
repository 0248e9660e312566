//! External reasoning capability for the last normalization tier
//!
//! Backends are registered by name; each normalization call names the one
//! it wants (or `disabled`) in its configuration.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::ConceptCandidate;

/// Provider name that turns the reasoning tier off
pub const DISABLED_PROVIDER: &str = "disabled";

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("Reasoning request timed out after {0} ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Reasoning provider '{0}' is disabled or not registered")]
    Disabled(String),
}

/// Question sent to a reasoning backend
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest {
    pub source_value: String,
    pub field_path: String,
    pub domain: String,
    /// Free-text context from the caller (source system, sample record)
    pub context: Option<String>,
    /// Top semantic candidates, best first
    pub candidates: Vec<ConceptCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningAlternative {
    pub concept_id: i64,
    pub confidence: f32,
}

/// Backend answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    pub concept_id: i64,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<ReasoningAlternative>,
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ReasoningError>;
}

/// Named reasoning backends
#[derive(Clone, Default)]
pub struct ReasoningRegistry {
    backends: HashMap<String, Arc<dyn ReasoningBackend>>,
}

impl ReasoningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name (replaces an existing one)
    pub fn register(&mut self, backend: Arc<dyn ReasoningBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Backend for a provider name; `None` for `disabled` or unknown names
    pub fn get(&self, provider: &str) -> Option<Arc<dyn ReasoningBackend>> {
        if provider.eq_ignore_ascii_case(DISABLED_PROVIDER) {
            return None;
        }
        self.backends.get(provider).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

/// HTTP reasoning backend with request rate limiting
pub struct HttpReasoningClient {
    name: String,
    http_client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    limiter: DefaultDirectRateLimiter,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct HttpReasoningBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(flatten)]
    request: &'a ReasoningRequest,
}

impl HttpReasoningClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: String,
        model: Option<String>,
        api_key: Option<String>,
        timeout_ms: u64,
        requests_per_second: u32,
    ) -> Result<Self, ReasoningError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;

        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            name: name.into(),
            http_client,
            endpoint,
            model,
            api_key,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            timeout_ms,
        })
    }
}

#[async_trait]
impl ReasoningBackend for HttpReasoningClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
        self.limiter.until_ready().await;

        let mut builder = self.http_client.post(&self.endpoint).json(&HttpReasoningBody {
            model: self.model.as_deref(),
            request,
        });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ReasoningError::Timeout(self.timeout_ms)
            } else {
                ReasoningError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Transport(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let parsed: ReasoningResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::InvalidResponse(e.to_string()))?;

        if !(0.0..=1.0).contains(&parsed.confidence) {
            return Err(ReasoningError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                parsed.confidence
            )));
        }
        Ok(parsed)
    }
}
