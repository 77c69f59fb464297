//! Job sources: how the runner learns about new jobs.
//!
//! Every source first yields the jobs already `pending` when it starts, oldest
//! first, then whatever arrives afterwards. A job may be yielded more than
//! once (backlog and notification, or two bridges); the runner's claim step
//! makes that harmless.

use crate::error::{BridgeError, Result};
use crate::jobs::{JobFilter, JobStore};
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A stream of job ids to process.
#[async_trait]
pub trait JobSource: Send {
    /// Waits for the next job id.
    ///
    /// Returns `Ok(None)` once the source is exhausted and will never yield
    /// again. Errors are transient; the caller may keep calling.
    async fn next_job(&mut self) -> Result<Option<Uuid>>;
}

/// Ids of pending jobs, oldest first.
async fn pending_ids(store: &dyn JobStore) -> Result<Vec<Uuid>> {
    Ok(store
        .list(&JobFilter::pending())
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect())
}

/// Extracts a job id from a notification payload.
///
/// Accepts a bare id or a JSON object carrying `id` (directly or under
/// `record` or `new`), as change-feed triggers commonly send.
pub fn parse_payload(payload: &str) -> Option<Uuid> {
    let payload = payload.trim();
    if let Ok(id) = Uuid::parse_str(payload) {
        return Some(id);
    }

    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let id = value
        .get("id")
        .or_else(|| {
            ["record", "new"]
                .iter()
                .find_map(|k| value.get(*k).and_then(|r| r.get("id")))
        })?
        .as_str()?;
    Uuid::parse_str(id).ok()
}

/// Source fed by PostgreSQL `LISTEN/NOTIFY`.
pub struct PgNotifySource {
    listener: PgListener,
    store: Arc<dyn JobStore>,
    queue: VecDeque<Uuid>,
    needs_scan: bool,
}

impl PgNotifySource {
    /// Subscribes to `channel` on the primary database.
    ///
    /// The subscription is in place before the backlog is read, so a job
    /// inserted in between is seen at least once.
    pub async fn connect(pool: &PgPool, channel: &str, store: Arc<dyn JobStore>) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await.map_err(|e| {
            BridgeError::persistence(format!("Failed to open notification connection: {e}"))
        })?;

        listener
            .listen(channel)
            .await
            .map_err(|e| BridgeError::persistence(format!("Failed to LISTEN on {channel}: {e}")))?;

        info!("Listening for new jobs on channel {}", channel);

        Ok(Self {
            listener,
            store,
            queue: VecDeque::new(),
            needs_scan: true,
        })
    }
}

#[async_trait]
impl JobSource for PgNotifySource {
    async fn next_job(&mut self) -> Result<Option<Uuid>> {
        loop {
            if self.needs_scan {
                let backlog = pending_ids(self.store.as_ref()).await?;
                if !backlog.is_empty() {
                    info!("Recovered {} pending jobs", backlog.len());
                }
                self.queue.extend(backlog);
                self.needs_scan = false;
            }

            if let Some(id) = self.queue.pop_front() {
                return Ok(Some(id));
            }

            let notification = self.listener.try_recv().await.map_err(|e| {
                BridgeError::persistence(format!("Notification connection failed: {e}"))
            })?;

            match notification {
                Some(notification) => match parse_payload(notification.payload()) {
                    Some(id) => return Ok(Some(id)),
                    None => warn!(
                        "Ignoring notification with unrecognized payload: {}",
                        notification.payload()
                    ),
                },
                None => {
                    // Notifications sent while reconnecting are lost.
                    warn!("Notification connection lost; rescanning pending jobs");
                    self.needs_scan = true;
                }
            }
        }
    }
}

/// Source that polls the job table for pending jobs.
pub struct PollingSource {
    store: Arc<dyn JobStore>,
    interval: Duration,
    queue: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    polled: bool,
}

impl PollingSource {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            queue: VecDeque::new(),
            seen: HashSet::new(),
            polled: false,
        }
    }

    async fn poll(&mut self) -> Result<()> {
        let pending = pending_ids(self.store.as_ref()).await?;

        // Forget ids that left `pending`; keeps `seen` bounded.
        let still_pending: HashSet<Uuid> = pending.iter().copied().collect();
        self.seen.retain(|id| still_pending.contains(id));

        for id in pending {
            if self.seen.insert(id) {
                self.queue.push_back(id);
            }
        }

        debug!("Poll found {} new pending jobs", self.queue.len());
        Ok(())
    }
}

#[async_trait]
impl JobSource for PollingSource {
    async fn next_job(&mut self) -> Result<Option<Uuid>> {
        loop {
            if let Some(id) = self.queue.pop_front() {
                return Ok(Some(id));
            }
            if self.polled {
                tokio::time::sleep(self.interval).await;
            }
            self.polled = true;
            self.poll().await?;
        }
    }
}

/// Source fed by an in-process channel.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Uuid>,
    backlog: Option<Arc<dyn JobStore>>,
    queue: VecDeque<Uuid>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::UnboundedReceiver<Uuid>) -> Self {
        Self {
            rx,
            backlog: None,
            queue: VecDeque::new(),
        }
    }

    /// Also yields the store's pending jobs before reading the channel.
    pub fn with_backlog(mut self, store: Arc<dyn JobStore>) -> Self {
        self.backlog = Some(store);
        self
    }
}

/// Creates a connected sender and channel source.
pub fn channel() -> (mpsc::UnboundedSender<Uuid>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSource::new(rx))
}

#[async_trait]
impl JobSource for ChannelSource {
    async fn next_job(&mut self) -> Result<Option<Uuid>> {
        if let Some(store) = &self.backlog {
            let backlog = pending_ids(store.as_ref()).await?;
            self.queue.extend(backlog);
            self.backlog = None;
        }
        if let Some(id) = self.queue.pop_front() {
            return Ok(Some(id));
        }
        Ok(self.rx.recv().await)
    }
}
