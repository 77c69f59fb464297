//! Sync job records and their lifecycle.
//!
//! A job moves `pending → running → success | failed`. Terminal states never
//! change again. The dispatcher is the only code that creates jobs; the runner
//! is the only code that moves them forward.

mod dispatcher;

pub use dispatcher::Dispatcher;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    /// Returns the status as stored in the `sync_jobs.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for `success` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(&s.to_lowercase()).ok_or_else(|| {
            format!("Invalid job status: {s}. Expected: pending, running, success, or failed")
        })
    }
}

/// A sync job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub query_name: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// A freshly dispatched job.
    pub fn new_pending(query_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            query_name: query_name.into(),
            status: JobStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter options for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub query_name: Option<String>,
    pub limit: Option<i64>,
}

impl JobFilter {
    /// Jobs still waiting for a runner, oldest first.
    pub fn pending() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            ..Self::default()
        }
    }

    /// Whether `job` passes this filter (limit excluded).
    pub fn matches(&self, job: &SyncJob) -> bool {
        self.status.map_or(true, |status| status == job.status)
            && self
                .query_name
                .as_deref()
                .map_or(true, |name| name == job.query_name)
    }
}

/// Storage for sync job records.
///
/// Every write is a single committed statement; the conditional transitions
/// are what give at-most-once execution when several runners see the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new `pending` job and returns its id.
    async fn insert_pending(&self, query_name: &str) -> Result<Uuid>;

    /// Moves a job from `pending` to `running`.
    ///
    /// Returns `Ok(false)` when the job was not pending (already claimed,
    /// finished, or missing), in which case the caller must not run it.
    async fn claim(&self, id: Uuid) -> Result<bool>;

    /// Moves a running job to `success`.
    async fn mark_success(&self, id: Uuid) -> Result<()>;

    /// Moves a running job to `failed`, recording `message`.
    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<()>;

    /// Fetches a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<SyncJob>>;

    /// Lists jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<SyncJob>>;
}
