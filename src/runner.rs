//! Job runner: drives each job from `pending` to a terminal state.
//!
//! The run loop only receives ids and spawns work, so a slow job never stops
//! new ones from being picked up. Jobs for the same destination table run one
//! after another; overall parallelism is capped by a semaphore.

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::jobs::{JobStatus, JobStore, SyncJob};
use crate::knowledge::KnowledgeStore;
use crate::listener::JobSource;
use crate::sink::{destination_table, ResultSink, DEFAULT_TABLE_PREFIX};
use crate::source::SourceClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delay before asking a failing job source again.
const SOURCE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runner tuning.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_concurrent_jobs: usize,
    pub query_timeout: Duration,
    pub table_prefix: String,
    /// Upsert key columns per query name.
    pub keys: HashMap<String, Vec<String>>,
    /// Wait before retrying a job the store could not load or claim.
    pub requeue_delay: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            query_timeout: Duration::from_secs(300),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            keys: HashMap::new(),
            requeue_delay: Duration::from_secs(1),
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.runner.max_concurrent_jobs.max(1),
            query_timeout: config.runner.query_timeout(),
            table_prefix: config.sink.table_prefix.clone(),
            keys: config.sink.keys.clone(),
            requeue_delay: config.runner.retry_base_delay(),
        }
    }
}

/// What happened to one job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Not run here: missing, no longer pending, or claimed elsewhere.
    Skipped,
    /// Finished `success` with this many rows written.
    Succeeded { rows_written: u64 },
    /// Finished `failed`, or its status could not be recorded.
    Failed { error: BridgeError },
    /// Still `pending`: the store failed before the claim. The run loop
    /// retries these.
    Deferred { error: BridgeError },
}

/// The bridge's job runner.
#[derive(Clone)]
pub struct Runner {
    jobs: Arc<dyn JobStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn ResultSink>,
    settings: Arc<RunnerSettings>,
    table_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    permits: Arc<Semaphore>,
}

impl Runner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        source: Arc<dyn SourceClient>,
        sink: Arc<dyn ResultSink>,
        settings: RunnerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            jobs,
            knowledge,
            source,
            sink,
            settings: Arc::new(settings),
            table_locks: Arc::new(Mutex::new(HashMap::new())),
            permits,
        }
    }

    /// Receives jobs from `source` until it is exhausted or `shutdown` fires,
    /// then waits for in-flight jobs to finish.
    pub async fn run<S>(&self, source: &mut S, shutdown: CancellationToken) -> Result<()>
    where
        S: JobSource + ?Sized,
    {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested; no longer accepting jobs");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Job task ended abnormally: {}", e);
                    }
                }
                Some(id) = requeue_rx.recv() => {
                    debug!("Retrying job {}", id);
                    self.spawn_job(&mut tasks, id, &requeue_tx, &shutdown);
                }
                next = source.next_job() => match next {
                    Ok(Some(id)) => {
                        info!("Received job {}", id);
                        self.spawn_job(&mut tasks, id, &requeue_tx, &shutdown);
                    }
                    Ok(None) => {
                        debug!("Job source exhausted");
                        break;
                    }
                    Err(e) => {
                        error!("Job source failed: {}", e);
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(SOURCE_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight jobs", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Job task ended abnormally: {}", e);
            }
        }

        Ok(())
    }

    /// Processes `id` on the task set. A deferred job is sent back through
    /// `requeue` after `requeue_delay`, unless shutdown comes first.
    fn spawn_job(
        &self,
        tasks: &mut JoinSet<()>,
        id: Uuid,
        requeue: &mpsc::UnboundedSender<Uuid>,
        shutdown: &CancellationToken,
    ) {
        let runner = self.clone();
        let requeue = requeue.clone();
        let shutdown = shutdown.clone();

        tasks.spawn(async move {
            if let JobOutcome::Deferred { .. } = runner.process_job(id).await {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(runner.settings.requeue_delay) => {
                        let _ = requeue.send(id);
                    }
                }
            }
        });
    }

    /// Runs one job to a terminal state.
    ///
    /// Never returns an error: every failure ends up in the job record, or in
    /// the log when the record itself cannot be written. A store failure
    /// before the claim leaves the job `pending` and returns `Deferred`.
    pub async fn process_job(&self, id: Uuid) -> JobOutcome {
        let job = match self.jobs.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Job {} not found; skipping", id);
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!("Failed to load job {}, will retry: {}", id, e);
                return JobOutcome::Deferred { error: e };
            }
        };

        if job.status != JobStatus::Pending {
            debug!("Job {} is already {}; skipping", id, job.status);
            return JobOutcome::Skipped;
        }

        let table = destination_table(&self.settings.table_prefix, &job.query_name);
        let table_lock = self.table_lock(&table);
        let _table_guard = table_lock.lock().await;
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return JobOutcome::Skipped,
        };

        match self.jobs.claim(id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job {} was claimed elsewhere; skipping", id);
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!("Failed to mark job {} running, will retry: {}", id, e);
                return JobOutcome::Deferred { error: e };
            }
        }

        debug!("Job {} running query {}", id, job.query_name);
        let started = Instant::now();
        let result = self.execute(&job, &table).await;

        match result {
            Ok(rows_written) => match self.jobs.mark_success(id).await {
                Ok(()) => {
                    info!(
                        "Job {} ({}) succeeded in {:?}",
                        id,
                        job.query_name,
                        started.elapsed()
                    );
                    JobOutcome::Succeeded { rows_written }
                }
                Err(e) => {
                    error!("Job {} succeeded but its status could not be saved: {}", id, e);
                    JobOutcome::Failed { error: e }
                }
            },
            Err(job_error) => {
                if job_error.is_operator_visible() {
                    error!("Job {} ({}) failed: {}", id, job.query_name, job_error);
                } else {
                    warn!("Job {} ({}) failed: {}", id, job.query_name, job_error);
                }
                if let Err(e) = self.jobs.mark_failed(id, &job_error.to_string()).await {
                    error!("Job {} failed but its status could not be saved: {}", id, e);
                }
                JobOutcome::Failed { error: job_error }
            }
        }
    }

    /// Lookup, execute, upsert. Returns rows written.
    async fn execute(&self, job: &SyncJob, table: &str) -> Result<u64> {
        let known = self.knowledge.lookup(&job.query_name).await?.ok_or_else(|| {
            BridgeError::lookup(format!(
                "Query '{}' not found in the knowledge store",
                job.query_name
            ))
        })?;

        let timeout = self.settings.query_timeout;
        let rows = tokio::time::timeout(timeout, self.source.execute(&known.raw_query))
            .await
            .map_err(|_| {
                BridgeError::timeout(format!(
                    "Query '{}' did not finish within {}s",
                    job.query_name,
                    timeout.as_secs_f64()
                ))
            })??;

        info!(
            "Job {} fetched {} rows from {}",
            job.id,
            rows.row_count(),
            job.query_name
        );

        if rows.is_empty() {
            return Ok(0);
        }

        let keys = self.settings.keys.get(&job.query_name).map(|k| k.as_slice());
        let written = self.sink.upsert(table, &rows, keys).await?;
        info!("Job {} upserted {} rows into {}", job.id, written, table);
        Ok(written)
    }

    fn table_lock(&self, table: &str) -> Arc<AsyncMutex<()>> {
        self.table_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .clone()
    }
}
