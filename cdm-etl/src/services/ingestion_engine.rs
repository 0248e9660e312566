//! Streaming ingestion engine
//!
//! Drains a [`SourceConnector`] for one job. Each item is classified,
//! transformed and written to staging; any record-level failure goes to the
//! dead-letter store instead. Counters change only after the write result is
//! known, so `processed + failed == received` holds at every flush.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cdm_common::events::{EventBus, PipelineEvent};

use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    DeadLetterRecord, FieldTransform, Job, JobMetrics, JobState, RawRecord, SourceItem,
    StagingRecord,
};
use crate::services::source_connector::{DeadLetterReplayConnector, SourceConnector};
use crate::utils::db_retry::retry_on_lock;

/// Engine tunables
#[derive(Debug, Clone, Copy)]
pub struct IngestionSettings {
    /// Persist counters every N received records
    pub metrics_flush_interval: u64,
    /// Upper bound on lock-contention retries for one staging write
    pub max_lock_wait_ms: u64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            metrics_flush_interval: 50,
            max_lock_wait_ms: 5000,
        }
    }
}

impl From<&cdm_common::config::IngestionSection> for IngestionSettings {
    fn from(config: &cdm_common::config::IngestionSection) -> Self {
        Self {
            metrics_flush_interval: config.metrics_flush_interval.max(1),
            max_lock_wait_ms: config.max_lock_wait_ms,
        }
    }
}

/// Result of writing one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Staging write confirmed; carries the staging record id
    Staged(String),
    /// Record-level failure; the record goes to the dead-letter store
    Failed { reason: String },
}

/// Final state of a run
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: Job,
    /// Ended because a stop was requested
    pub stopped: bool,
}

struct ActiveJob {
    cancel: CancellationToken,
    metrics: JobMetrics,
}

/// Ingestion engine shared by the API and background tasks
#[derive(Clone)]
pub struct IngestionEngine {
    db: SqlitePool,
    event_bus: EventBus,
    settings: IngestionSettings,
    active: Arc<RwLock<HashMap<String, ActiveJob>>>,
}

impl IngestionEngine {
    pub fn new(db: SqlitePool, event_bus: EventBus, settings: IngestionSettings) -> Self {
        Self {
            db,
            event_bus,
            settings,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist a new job in CREATED state
    ///
    /// `job_id` is generated when not given; an existing id is rejected.
    pub async fn create_job(
        &self,
        job_id: Option<String>,
        name: &str,
        config: FieldTransform,
    ) -> PipelineResult<Job> {
        config.validate().map_err(PipelineError::Configuration)?;

        let job = match job_id {
            Some(id) => {
                if id.trim().is_empty() {
                    return Err(PipelineError::InvalidInput("job id is empty".to_string()));
                }
                if db::jobs::load_job(&self.db, &id).await?.is_some() {
                    return Err(PipelineError::InvalidInput(format!("job '{}' already exists", id)));
                }
                Job::with_id(id, name, config)
            }
            None => Job::new(name, config),
        };

        db::jobs::save_job(&self.db, &job).await?;
        tracing::info!(job_id = %job.job_id, name = %job.name, "Job created");
        Ok(job)
    }

    /// Job as stored, with live counters overlaid while it runs
    pub async fn job_status(&self, job_id: &str) -> PipelineResult<Job> {
        let mut job = db::jobs::load_job(&self.db, job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job '{}'", job_id)))?;

        if let Some(metrics) = self.live_metrics(job_id).await {
            job.metrics = metrics;
        }
        Ok(job)
    }

    /// Counters of a running job
    pub async fn live_metrics(&self, job_id: &str) -> Option<JobMetrics> {
        self.active.read().await.get(job_id).map(|a| a.metrics.clone())
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.active.read().await.contains_key(job_id)
    }

    /// Signal a running job to stop after its in-flight record
    ///
    /// Returns `false` when the job is not running.
    pub async fn request_stop(&self, job_id: &str) -> bool {
        match self.active.read().await.get(job_id) {
            Some(active) => {
                tracing::info!(job_id = %job_id, "Stop requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a job in a background task
    ///
    /// The CREATED check happens before spawning so callers get the
    /// configuration error synchronously.
    pub async fn spawn_job<C>(&self, job_id: &str, connector: C) -> PipelineResult<()>
    where
        C: SourceConnector + 'static,
    {
        let job = self.load_created(job_id).await?;
        let cancel = CancellationToken::new();
        self.register(&job.job_id, cancel.clone()).await?;

        let engine = self.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_registered(job, connector, cancel).await {
                tracing::error!(job_id = %job_id, error = %e, "Ingestion task ended with error");
            }
            engine.unregister(&job_id).await;
        });

        Ok(())
    }

    /// Run a job to completion on the current task
    pub async fn run_job<C>(
        &self,
        job_id: &str,
        connector: C,
        cancel: CancellationToken,
    ) -> PipelineResult<JobOutcome>
    where
        C: SourceConnector,
    {
        let job = self.load_created(job_id).await?;
        self.register(&job.job_id, cancel.clone()).await?;

        let result = self.run_registered(job, connector, cancel).await;
        self.unregister(job_id).await;
        result
    }

    /// Replay another job's dead letters into a new job (started in background)
    pub async fn replay_dead_letters(
        &self,
        source_job_id: &str,
        name: Option<&str>,
        config: FieldTransform,
    ) -> PipelineResult<Job> {
        if db::jobs::load_job(&self.db, source_job_id).await?.is_none() {
            return Err(PipelineError::NotFound(format!("job '{}'", source_job_id)));
        }

        let letters = db::dead_letters::find_by_job(&self.db, source_job_id).await?;
        if letters.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "job '{}' has no dead letters to replay",
                source_job_id
            )));
        }

        let default_name = format!("replay of {}", source_job_id);
        let job = self
            .create_job(None, name.unwrap_or(&default_name), config)
            .await?;

        tracing::info!(
            job_id = %job.job_id,
            source_job_id = %source_job_id,
            letters = letters.len(),
            "Replaying dead letters"
        );

        self.spawn_job(&job.job_id, DeadLetterReplayConnector::new(source_job_id, letters))
            .await?;
        Ok(job)
    }

    async fn load_created(&self, job_id: &str) -> PipelineResult<Job> {
        let job = db::jobs::load_job(&self.db, job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job '{}'", job_id)))?;

        if job.state != JobState::Created {
            return Err(PipelineError::Configuration(format!(
                "job '{}' is {}, only CREATED jobs can be started",
                job_id,
                job.state.as_str()
            )));
        }
        Ok(job)
    }

    async fn register(&self, job_id: &str, cancel: CancellationToken) -> PipelineResult<()> {
        let mut active = self.active.write().await;
        if active.contains_key(job_id) {
            return Err(PipelineError::Configuration(format!(
                "job '{}' is already running",
                job_id
            )));
        }
        active.insert(
            job_id.to_string(),
            ActiveJob {
                cancel,
                metrics: JobMetrics::new(job_id),
            },
        );
        Ok(())
    }

    async fn unregister(&self, job_id: &str) {
        self.active.write().await.remove(job_id);
    }

    async fn publish_metrics(&self, metrics: &JobMetrics) {
        if let Some(active) = self.active.write().await.get_mut(&metrics.job_id) {
            active.metrics = metrics.clone();
        }
    }

    async fn run_registered<C>(
        &self,
        mut job: Job,
        mut connector: C,
        cancel: CancellationToken,
    ) -> PipelineResult<JobOutcome>
    where
        C: SourceConnector,
    {
        let max_lock_wait_ms =
            db::settings::get_max_lock_wait_ms(&self.db, self.settings.max_lock_wait_ms).await?;

        job.transition_to(JobState::Running)
            .map_err(PipelineError::Configuration)?;
        db::jobs::save_job(&self.db, &job).await?;

        let source = connector.describe();
        tracing::info!(job_id = %job.job_id, source = %source, "Ingestion started");
        self.event_bus.emit_lossy(PipelineEvent::JobStarted {
            job_id: job.job_id.clone(),
            source,
            timestamp: Utc::now(),
        });

        let mut metrics = JobMetrics::new(job.job_id.clone());
        let mut stopped = false;
        let mut fatal: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                stopped = true;
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped = true;
                    break;
                }
                next = connector.next_item() => next,
            };

            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    fatal = Some(e.to_string());
                    break;
                }
            };

            metrics.record_received();
            let raw = item.raw_text();

            match self.write_record(&job, item, max_lock_wait_ms).await {
                WriteOutcome::Staged(_) => metrics.record_processed(),
                WriteOutcome::Failed { reason } => {
                    metrics.record_failed();
                    tracing::debug!(job_id = %job.job_id, reason = %reason, "Record dead-lettered");

                    let letter = DeadLetterRecord::new(job.job_id.clone(), raw, reason);
                    if let Err(e) = db::dead_letters::insert_dead_letter(&self.db, &letter).await {
                        fatal = Some(format!("dead-letter write failed: {}", e));
                        break;
                    }
                }
            }

            self.publish_metrics(&metrics).await;

            if metrics.received % self.settings.metrics_flush_interval.max(1) == 0 {
                if let Err(e) = self.flush_metrics(&metrics).await {
                    fatal = Some(format!("metrics flush failed: {}", e));
                    break;
                }
            }
        }

        job.metrics = metrics;

        let error = match fatal {
            Some(error) => error,
            None => {
                let mut completed = job.clone();
                completed
                    .transition_to(JobState::Completed)
                    .map_err(PipelineError::Configuration)?;
                match db::jobs::save_job(&self.db, &completed).await {
                    Ok(()) => {
                        self.report_completed(&completed, stopped);
                        return Ok(JobOutcome {
                            job: completed,
                            stopped,
                        });
                    }
                    Err(e) => format!("final state write failed: {}", e),
                }
            }
        };

        tracing::error!(job_id = %job.job_id, error = %error, "Ingestion failed");
        job.fail(error.clone()).map_err(PipelineError::Configuration)?;
        // Best effort; the outcome reports FAILED either way
        if let Err(e) = db::jobs::save_job(&self.db, &job).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to persist FAILED state");
        }
        self.event_bus.emit_lossy(PipelineEvent::JobFailed {
            job_id: job.job_id.clone(),
            error,
            timestamp: Utc::now(),
        });
        Ok(JobOutcome { job, stopped: false })
    }

    fn report_completed(&self, job: &Job, stopped: bool) {
        tracing::info!(
            job_id = %job.job_id,
            received = job.metrics.received,
            processed = job.metrics.processed,
            failed = job.metrics.failed,
            stopped,
            "Ingestion completed"
        );
        self.event_bus.emit_lossy(PipelineEvent::JobCompleted {
            job_id: job.job_id.clone(),
            received: job.metrics.received,
            processed: job.metrics.processed,
            failed: job.metrics.failed,
            stopped,
            timestamp: Utc::now(),
        });
    }

    async fn flush_metrics(&self, metrics: &JobMetrics) -> PipelineResult<()> {
        db::jobs::save_metrics(&self.db, metrics).await?;
        self.event_bus.emit_lossy(PipelineEvent::JobProgress {
            job_id: metrics.job_id.clone(),
            received: metrics.received,
            processed: metrics.processed,
            failed: metrics.failed,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Classify, transform and stage one item
    async fn write_record(&self, job: &Job, item: SourceItem, max_lock_wait_ms: u64) -> WriteOutcome {
        let value = match item {
            SourceItem::Parsed(value) => value,
            SourceItem::Malformed { reason, .. } => return WriteOutcome::Failed { reason },
        };

        let record = match RawRecord::classify(value).and_then(|r| job.config.apply(r)) {
            Ok(record) => record,
            Err(reason) => return WriteOutcome::Failed { reason },
        };

        let staged = StagingRecord::new(job.job_id.clone(), record);
        let result = retry_on_lock("staging insert", max_lock_wait_ms, || {
            db::staging::insert_record(&self.db, &staged)
        })
        .await;

        match result {
            Ok(()) => WriteOutcome::Staged(staged.id),
            Err(e) => WriteOutcome::Failed {
                reason: format!("staging write failed: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::source_connector::MemoryConnector;
    use serde_json::json;

    fn engine(pool: SqlitePool) -> IngestionEngine {
        IngestionEngine::new(pool, EventBus::new(64), IngestionSettings::default())
    }

    fn required(field: &str) -> FieldTransform {
        FieldTransform {
            required: vec![field.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failures_are_dead_lettered_and_counted() {
        let pool = crate::db::memory_pool().await;
        let engine = engine(pool.clone());
        let job = engine.create_job(None, "labs", required("code")).await.unwrap();

        let connector = MemoryConnector::from_items(
            vec![
                SourceItem::Parsed(json!({"code": "A1"})),
                SourceItem::Parsed(json!({"other": "x"})),
                SourceItem::Malformed {
                    raw: "{oops".to_string(),
                    reason: "malformed JSON: eof".to_string(),
                },
                SourceItem::Parsed(json!({"code": "B2"})),
            ],
            "test",
        );

        let outcome = engine
            .run_job(&job.job_id, connector, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.job.state, JobState::Completed);
        assert!(!outcome.stopped);
        assert_eq!(outcome.job.metrics.received, 4);
        assert_eq!(outcome.job.metrics.processed, 2);
        assert_eq!(outcome.job.metrics.failed, 2);

        let letters = db::dead_letters::find_by_job(&pool, &job.job_id).await.unwrap();
        assert_eq!(letters.len(), 2);
        assert!(letters.iter().any(|l| l.failure_reason == "missing required field 'code'"));
        assert!(letters.iter().any(|l| l.raw_payload == "{oops"));
        assert_eq!(db::staging::count_by_job(&pool, &job.job_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_create() {
        let pool = crate::db::memory_pool().await;
        let config = FieldTransform {
            required: vec!["a".to_string(), "a".to_string()],
            ..Default::default()
        };
        let result = engine(pool).create_job(None, "bad", config).await;
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_completed_job_cannot_restart() {
        let pool = crate::db::memory_pool().await;
        let engine = engine(pool);
        let job = engine.create_job(Some("J1".to_string()), "once", FieldTransform::default()).await.unwrap();

        engine
            .run_job(&job.job_id, MemoryConnector::new(vec![json!({"a": "1"})]), CancellationToken::new())
            .await
            .unwrap();

        let again = engine
            .run_job(&job.job_id, MemoryConnector::new(vec![]), CancellationToken::new())
            .await;
        assert!(matches!(again, Err(PipelineError::Configuration(_))));
        assert!(!engine.is_running("J1").await);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_stops_before_first_record() {
        let pool = crate::db::memory_pool().await;
        let engine = engine(pool);
        let job = engine.create_job(None, "stop", FieldTransform::default()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine
            .run_job(&job.job_id, MemoryConnector::new(vec![json!({"a": "1"})]), cancel)
            .await
            .unwrap();

        assert!(outcome.stopped);
        assert_eq!(outcome.job.state, JobState::Completed);
        assert_eq!(outcome.job.metrics.received, 0);
    }

    async fn block_updates(pool: &SqlitePool, when: &str) {
        let sql = format!(
            "CREATE TRIGGER block_jobs_update BEFORE UPDATE ON jobs WHEN {} \
             BEGIN SELECT RAISE(ABORT, 'jobs update blocked'); END",
            when
        );
        sqlx::query(&sql).execute(pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_failure_fails_job() {
        let pool = crate::db::memory_pool().await;
        let settings = IngestionSettings {
            metrics_flush_interval: 1,
            ..Default::default()
        };
        let engine = IngestionEngine::new(pool.clone(), EventBus::new(64), settings);
        let job = engine.create_job(Some("F1".to_string()), "flush", FieldTransform::default()).await.unwrap();
        block_updates(&pool, "NEW.state = 'RUNNING' AND NEW.received > 0").await;

        let outcome = engine
            .run_job(&job.job_id, MemoryConnector::new(vec![json!({"a": "1"}), json!({"a": "2"})]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.job.state, JobState::Failed);
        assert_eq!(outcome.job.metrics.received, 1);
        assert!(!engine.is_running("F1").await);

        let stored = db::jobs::load_job(&pool, "F1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.error.unwrap().starts_with("metrics flush failed"));
    }

    #[tokio::test]
    async fn test_final_save_failure_fails_job() {
        let pool = crate::db::memory_pool().await;
        let engine = engine(pool.clone());
        let job = engine.create_job(Some("F2".to_string()), "final", FieldTransform::default()).await.unwrap();
        block_updates(&pool, "NEW.state = 'COMPLETED'").await;

        let outcome = engine
            .run_job(&job.job_id, MemoryConnector::new(vec![json!({"a": "1"})]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.job.state, JobState::Failed);
        let stored = db::jobs::load_job(&pool, "F2").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.metrics.processed, 1);
        assert!(stored.error.unwrap().starts_with("final state write failed"));
    }

    #[tokio::test]
    async fn test_zero_flush_interval_does_not_panic() {
        let pool = crate::db::memory_pool().await;
        let settings = IngestionSettings {
            metrics_flush_interval: 0,
            ..Default::default()
        };
        let engine = IngestionEngine::new(pool.clone(), EventBus::new(64), settings);
        let job = engine.create_job(Some("Z".to_string()), "zero", FieldTransform::default()).await.unwrap();

        let outcome = engine
            .run_job(&job.job_id, MemoryConnector::new(vec![json!({"a": "1"}), json!({"a": "2"})]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.job.state, JobState::Completed);
        assert_eq!(outcome.job.metrics.processed, 2);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_rejected() {
        let pool = crate::db::memory_pool().await;
        let engine = engine(pool);
        engine.create_job(Some("dup".to_string()), "a", FieldTransform::default()).await.unwrap();
        let second = engine.create_job(Some("dup".to_string()), "b", FieldTransform::default()).await;
        assert!(matches!(second, Err(PipelineError::InvalidInput(_))));
    }
}
