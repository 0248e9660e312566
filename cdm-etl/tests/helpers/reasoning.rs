//! Scripted reasoning backend that counts its calls

use async_trait::async_trait;
use cdm_etl::services::{
    ReasoningAlternative, ReasoningBackend, ReasoningError, ReasoningRequest, ReasoningResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers from a fixed table keyed by source value
pub struct ScriptedReasoner {
    name: String,
    answers: HashMap<String, (i64, f32)>,
    alternatives: HashMap<String, Vec<ReasoningAlternative>>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedReasoner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            answers: HashMap::new(),
            alternatives: HashMap::new(),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn answer(mut self, source_value: &str, concept_id: i64, confidence: f32) -> Self {
        self.answers
            .insert(source_value.to_string(), (concept_id, confidence));
        self
    }

    /// Runner-up concepts returned with the answer for `source_value`
    pub fn alternatives(mut self, source_value: &str, alternatives: &[(i64, f32)]) -> Self {
        self.alternatives.insert(
            source_value.to_string(),
            alternatives
                .iter()
                .map(|&(concept_id, confidence)| ReasoningAlternative { concept_id, confidence })
                .collect(),
        );
        self
    }

    /// Sleep before answering (timeout tests)
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared call counter
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedReasoner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ReasoningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.answers.get(&request.source_value) {
            Some((concept_id, confidence)) => Ok(ReasoningResponse {
                concept_id: *concept_id,
                confidence: *confidence,
                rationale: format!("scripted answer for {}", request.source_value),
                alternatives: self
                    .alternatives
                    .get(&request.source_value)
                    .cloned()
                    .unwrap_or_default(),
            }),
            None => Err(ReasoningError::Transport("no scripted answer".to_string())),
        }
    }
}
