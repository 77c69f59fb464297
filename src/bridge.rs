//! Startup wiring for the bridge process.
//!
//! Builds every client from configuration and injects them into the runner;
//! nothing here is a global.

use crate::config::{Config, ListenerMode};
use crate::error::Result;
use crate::listener::{JobSource, PgNotifySource, PollingSource};
use crate::runner::{Runner, RunnerSettings};
use crate::source::{RetryPolicy, SourceClient, SqlServerClient};
use crate::store::PgStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connection retry policy from the runner settings.
pub fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        attempts: config.runner.connect_retries.max(1),
        base_delay: config.runner.retry_base_delay(),
    }
}

/// Opens the primary database and applies pending migrations.
pub async fn open_store(config: &Config) -> Result<PgStore> {
    info!("Primary database: {}", config.primary.display_string());
    let store = PgStore::connect(&config.primary, retry_policy(config)).await?;
    store.migrate().await?;
    Ok(store)
}

/// A configured bridge, ready to run.
pub struct Bridge {
    config: Config,
    store: Arc<PgStore>,
    source: Arc<SqlServerClient>,
    runner: Runner,
}

impl Bridge {
    /// Validates `config`, connects the primary database and prepares the
    /// source pool. Source connections open lazily on the first job.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(open_store(&config).await?);

        info!("Source database: {}", config.source.display_string());
        let source = Arc::new(SqlServerClient::new(
            config.source.clone(),
            retry_policy(&config),
        ));

        let runner = Runner::new(
            store.clone(),
            store.clone(),
            source.clone(),
            store.clone(),
            RunnerSettings::from_config(&config),
        );

        Ok(Self {
            config,
            store,
            source,
            runner,
        })
    }

    /// The job source selected by `listener.mode`.
    pub async fn job_source(&self) -> Result<Box<dyn JobSource>> {
        let listener = &self.config.listener;
        match listener.mode {
            ListenerMode::Notify => Ok(Box::new(
                PgNotifySource::connect(self.store.pool(), &listener.channel, self.store.clone())
                    .await?,
            )),
            ListenerMode::Poll => {
                info!("Polling for new jobs every {:?}", listener.poll_interval());
                Ok(Box::new(PollingSource::new(
                    self.store.clone(),
                    listener.poll_interval(),
                )))
            }
        }
    }

    /// Runs until `shutdown` fires, then drains in-flight jobs and closes
    /// every connection.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let reaper = self.source.pool().spawn_reaper();
        let mut jobs = self.job_source().await?;

        info!(
            "Bridge running (max {} concurrent jobs)",
            self.config.runner.max_concurrent_jobs
        );
        let result = self.runner.run(jobs.as_mut(), shutdown).await;

        reaper.abort();
        if let Err(e) = self.source.close().await {
            warn!("Failed to close source pool: {}", e);
        }
        self.store.close().await;
        info!("Bridge stopped");

        result
    }
}

/// A token cancelled on Ctrl-C (or SIGTERM on Unix).
pub fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
