//! Ingestion job state machine
//!
//! A job progresses CREATED → RUNNING → {COMPLETED | FAILED}.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::FieldTransform;

/// Ingestion job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Job persisted, not started
    Created,
    /// Connector is being drained
    Running,
    /// Source exhausted (or stop requested) without fatal error
    Completed,
    /// Fatal configuration or connector error
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(JobState::Created),
            "RUNNING" => Some(JobState::Running),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Allowed edges of the state machine
    ///
    /// CREATED may fail directly when its configuration is rejected at start.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Created, JobState::Running)
                | (JobState::Created, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Per-job record counters
///
/// Every received record ends up counted exactly once as processed or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub job_id: String,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
}

impl JobMetrics {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    /// Count a confirmed staging write
    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    /// Count a record routed to the dead-letter store
    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    /// Records received but not yet accounted for (in flight)
    pub fn in_flight(&self) -> u64 {
        self.received.saturating_sub(self.processed + self.failed)
    }

    pub fn is_consistent(&self) -> bool {
        self.processed + self.failed == self.received
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: String,
    pub old_state: JobState,
    pub new_state: JobState,
    pub transitioned_at: DateTime<Utc>,
}

/// Ingestion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub state: JobState,
    /// Field transformation applied to every record
    pub config: FieldTransform,
    pub metrics: JobMetrics,
    /// Fatal error that moved the job to FAILED
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create new job in CREATED state with a fresh id
    pub fn new(name: impl Into<String>, config: FieldTransform) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name, config)
    }

    /// Create new job with a caller-chosen id
    pub fn with_id(job_id: impl Into<String>, name: impl Into<String>, config: FieldTransform) -> Self {
        let job_id = job_id.into();
        Self {
            metrics: JobMetrics::new(job_id.clone()),
            job_id,
            name: name.into(),
            state: JobState::Created,
            config,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Transition to new state
    ///
    /// Returns `Err` with a description when the edge is not allowed.
    pub fn transition_to(&mut self, new_state: JobState) -> Result<StateTransition, String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Invalid job transition {} → {}",
                self.state.as_str(),
                new_state.as_str()
            ));
        }

        let now = Utc::now();
        let transition = StateTransition {
            job_id: self.job_id.clone(),
            old_state: self.state,
            new_state,
            transitioned_at: now,
        };
        self.state = new_state;

        match new_state {
            JobState::Running => self.started_at = Some(now),
            JobState::Completed | JobState::Failed => self.ended_at = Some(now),
            JobState::Created => {}
        }

        Ok(transition)
    }

    /// Move to FAILED recording the fatal error
    pub fn fail(&mut self, error: impl Into<String>) -> Result<StateTransition, String> {
        let transition = self.transition_to(JobState::Failed)?;
        self.error = Some(error.into());
        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
