//! Bounded connection pool for the SQL Server source.
//!
//! Connections are handed out as [`PooledConnection`] guards and go back to the
//! idle list when the guard drops. A guard dropped mid-query (timeout, panic,
//! error) discards its connection instead, since the TDS stream may be left
//! half-read. Idle connections past `idle_timeout` are closed, keeping `min`.

use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, Client, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

/// A live TDS client over TCP.
pub type TdsClient = Client<Compat<TcpStream>>;

/// Retry policy for establishing new connections.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay after the first failure; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

struct IdleConnection {
    client: TdsClient,
    idle_since: Instant,
}

struct PoolInner {
    config: SourceConfig,
    retry: RetryPolicy,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl PoolInner {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConnection>> {
        // A poisoned idle list only holds connections; keep using it.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict_expired(&self) -> usize {
        let idle_timeout = self.config.pool.idle_timeout();
        let min = self.config.pool.min as usize;
        let mut idle = self.lock_idle();

        // Releases push to the back and reuse pops from the back, so the
        // front holds the longest-idle connections.
        let expired = idle
            .iter()
            .take_while(|conn| conn.idle_since.elapsed() >= idle_timeout)
            .count();
        let evicted = expired.min(idle.len().saturating_sub(min));
        idle.drain(..evicted);
        if evicted > 0 {
            debug!("Evicted {} idle source connection(s)", evicted);
        }
        evicted
    }

    fn release(&self, client: TdsClient) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.lock_idle().push_back(IdleConnection {
            client,
            idle_since: Instant::now(),
        });
    }
}

/// Bounded pool of SQL Server connections.
#[derive(Clone)]
pub struct SourcePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePool")
            .field("target", &self.inner.config.display_string())
            .field("max", &self.inner.config.pool.max)
            .field("idle", &self.idle_count())
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl SourcePool {
    /// Creates a pool. No connection is opened until the first acquire.
    pub fn new(config: SourceConfig, retry: RetryPolicy) -> Self {
        let max = config.pool.max.max(1) as usize;
        Self {
            inner: Arc::new(PoolInner {
                config,
                retry,
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(max)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts a background task closing idle connections past their timeout.
    ///
    /// The task stops once the pool is closed or dropped.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = (self.inner.config.pool.idle_timeout() / 2).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.evict_expired();
            }
        })
    }

    /// Borrows a connection, opening a new one if none is idle.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::connection("Source connection pool is closed"));
        }

        let wait = self.inner.config.pool.connect_timeout();
        let permit = tokio::time::timeout(wait, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                BridgeError::connection(format!(
                    "Timed out after {:?} waiting for a free source connection (pool max {})",
                    wait, self.inner.config.pool.max
                ))
            })?
            .map_err(|_| BridgeError::connection("Source connection pool is closed"))?;

        self.inner.evict_expired();
        let reused = self.inner.lock_idle().pop_back();

        let client = match reused {
            Some(idle) => {
                debug!("Reusing idle source connection");
                idle.client
            }
            None => self.connect_with_retry().await?,
        };

        Ok(PooledConnection {
            client: Some(client),
            pool: Arc::clone(&self.inner),
            reusable: true,
            _permit: permit,
        })
    }

    async fn connect_with_retry(&self) -> Result<TdsClient> {
        let config = &self.inner.config;
        let attempts = self.inner.retry.attempts.max(1);
        let mut delay = self.inner.retry.base_delay;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!("Source connection attempt {} of {}", attempt, attempts);

            let timeout = config.pool.connect_timeout();
            let outcome = match tokio::time::timeout(timeout, connect_once(config)).await {
                Ok(result) => result,
                Err(_) => Err(format!("connection timed out after {timeout:?}")),
            };

            match outcome {
                Ok(client) => {
                    debug!("Connected to source {}", config.display_string());
                    return Ok(client);
                }
                Err(message) => {
                    let transient = is_transient_error(&message);
                    last_error = message;

                    if attempt < attempts && transient {
                        warn!(
                            "Source connection attempt {} failed (transient error), retrying in {:?}",
                            attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(map_connection_error(&last_error, config))
    }

    /// Number of idle connections held by the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    /// Number of connections currently borrowed.
    pub fn in_use(&self) -> usize {
        let max = self.inner.config.pool.max.max(1) as usize;
        max.saturating_sub(self.inner.permits.available_permits())
    }

    /// Closes every idle connection and refuses further acquires.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();

        let drained: Vec<IdleConnection> = self.inner.lock_idle().drain(..).collect();
        for idle in drained {
            if let Err(e) = idle.client.close().await {
                debug!("Error closing source connection: {e}");
            }
        }
    }
}

/// A connection borrowed from [`SourcePool`].
pub struct PooledConnection {
    client: Option<TdsClient>,
    pool: Arc<PoolInner>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Mutable access to the TDS client.
    pub fn client(&mut self) -> Result<&mut TdsClient> {
        self.client
            .as_mut()
            .ok_or_else(|| BridgeError::internal("source connection already released"))
    }

    /// Marks whether the connection can go back to the idle list on drop.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.reusable {
                self.pool.release(client);
            } else {
                debug!("Discarding source connection left in an unknown state");
            }
        }
    }
}

async fn connect_once(config: &SourceConfig) -> std::result::Result<TdsClient, String> {
    let mut tds = tiberius::Config::new();
    tds.host(config.host.as_deref().unwrap_or("localhost"));
    tds.port(config.port());
    if let Some(database) = &config.database {
        tds.database(database);
    }
    tds.authentication(AuthMethod::sql_server(
        config.user.as_deref().unwrap_or(""),
        config.password.as_deref().unwrap_or(""),
    ));
    tds.encryption(if config.encrypt {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::Off
    });
    if config.trust_cert {
        tds.trust_cert();
    }
    tds.application_name("sync-bridge");

    let tcp = TcpStream::connect(tds.get_addr())
        .await
        .map_err(|e| e.to_string())?;
    tcp.set_nodelay(true).map_err(|e| e.to_string())?;

    Client::connect(tds, tcp.compat_write())
        .await
        .map_err(|e| e.to_string())
}

/// Determines if a connection error is transient and worth retrying.
pub(crate) fn is_transient_error(message: &str) -> bool {
    let error_str = message.to_lowercase();

    if error_str.contains("login failed")
        || error_str.contains("authentication failed")
        || error_str.contains("cannot open database")
        || error_str.contains("certificate")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps a raw connection failure to a user-facing connection error.
pub(crate) fn map_connection_error(message: &str, config: &SourceConfig) -> BridgeError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port();
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = message.to_lowercase();

    if error_str.contains("connection refused") {
        BridgeError::connection(format!(
            "Cannot connect to {host}:{port}. Connection refused: {message}"
        ))
    } else if error_str.contains("login failed") || error_str.contains("authentication failed") {
        BridgeError::connection(format!(
            "Login failed for user '{user}': {message}. Check MSSQL_USER and MSSQL_PASS."
        ))
    } else if error_str.contains("cannot open database") {
        BridgeError::connection(format!(
            "Cannot open database '{database}' on {host}:{port}: {message}"
        ))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        BridgeError::connection(format!(
            "Connection to {host}:{port} timed out: {message}. The server may be overloaded or unreachable."
        ))
    } else if error_str.contains("certificate") || error_str.contains("tls") {
        BridgeError::connection(format!(
            "TLS negotiation with {host}:{port} failed: {message}. Check MSSQL_ENCRYPT and MSSQL_TRUST_CERT."
        ))
    } else {
        BridgeError::connection(format!("Cannot connect to {host}:{port}: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> SourceConfig {
        let mut config = SourceConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(1),
            database: Some("erp".to_string()),
            user: Some("reader".to_string()),
            ..SourceConfig::default()
        };
        config.pool.max = 2;
        config.pool.connect_timeout_ms = 2_000;
        config
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 1,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_error("Connection refused (os error 111)"));
        assert!(is_transient_error("connection timed out after 15s"));
        assert!(!is_transient_error(
            "Token error: 'Login failed for user 'sa'.' on server x"
        ));
        assert!(!is_transient_error("invalid certificate: UnknownIssuer"));
        assert!(!is_transient_error("something unexpected"));
    }

    #[test]
    fn test_map_connection_error_messages() {
        let config = unreachable_config();

        let err = map_connection_error("Connection refused (os error 111)", &config);
        assert_eq!(
            err,
            BridgeError::connection(
                "Cannot connect to 127.0.0.1:1. Connection refused: Connection refused (os error 111)"
            )
        );

        let err = map_connection_error("Login failed for user 'reader'.", &config);
        assert!(err.to_string().contains("Login failed for user 'reader'"));

        let err = map_connection_error("Cannot open database \"erp\" requested", &config);
        assert!(err.to_string().contains("Cannot open database 'erp'"));
        assert!(err.to_string().contains("Cannot open database \"erp\" requested"));

        let err = map_connection_error("Connection timed out after 15s", &config);
        assert!(err.to_string().contains("Connection timed out after 15s"));

        let err = map_connection_error("weird", &config);
        assert!(matches!(err, BridgeError::Connection(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_releases_permit() {
        let pool = SourcePool::new(unreachable_config(), no_retry());

        for _ in 0..3 {
            let err = pool.acquire().await.err().unwrap();
            assert!(matches!(err, BridgeError::Connection(_)));
        }

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = SourcePool::new(unreachable_config(), no_retry());
        pool.close().await;

        let err = pool.acquire().await.err().unwrap();
        assert!(err.to_string().contains("closed"));
    }
}
