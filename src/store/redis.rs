//! Redis-backed counter store.
//!
//! A single multiplexed connection is shared by every request. A supervisor
//! task owns its lifecycle: it connects, replaces the connection after a
//! connection-level failure or a command timeout with a fixed backoff, and
//! pings the server on a keepalive interval. Requests never wait for a
//! connection to come up; while none is established every call fails fast
//! with [`StoreError::Unavailable`].
//!
//! Each established connection carries a generation number. Failures are
//! reported against the generation they were observed on, so late reports
//! from a connection that was already replaced are ignored.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError, RedisResult, Script};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{CounterStore, Counted, StoreError};

/// Increments and sets a TTL only when the key has none, in one step.
///
/// A key that lost its TTL earlier gets one on the next increment.
const INCREMENT_WITH_TTL: &str = r"
local count = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) == -1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Sets a TTL only when the key exists and has none, on any Redis version.
const EXPIRE_IF_UNSET: &str = r"
if redis.call('TTL', KEYS[1]) == -1 then
  return redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return 0
";

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// `redis://` or `rediss://` (TLS) URL.
    pub url: String,
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Upper bound on a single command; exceeding it counts as unavailable
    /// and replaces the connection.
    pub command_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// How often an idle connection is pinged.
    pub keepalive_interval: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(250),
            reconnect_backoff: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
struct Connection {
    generation: u64,
    conn: MultiplexedConnection,
}

/// Connection state shared by the store and its supervisor.
struct Shared {
    slot: RwLock<Option<Connection>>,
    reconnect: Notify,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            slot: RwLock::new(None),
            reconnect: Notify::new(),
            connected,
        }
    }

    fn current(&self) -> Option<Connection> {
        self.slot.read().clone()
    }

    fn is_connected(&self) -> bool {
        self.slot.read().is_some()
    }

    fn install(&self, generation: u64, conn: MultiplexedConnection) {
        let mut slot = self.slot.write();
        *slot = Some(Connection { generation, conn });
        self.connected.send_replace(true);
    }

    /// Drop the connection if it is still `generation`.
    fn disconnect(&self, generation: u64) -> bool {
        let mut slot = self.slot.write();
        if slot.as_ref().map(|c| c.generation) != Some(generation) {
            return false;
        }
        *slot = None;
        self.connected.send_replace(false);
        true
    }

    /// Drop a broken connection and wake the supervisor. Returns false when
    /// `generation` was already replaced.
    fn report_broken(&self, generation: u64) -> bool {
        let broken = self.disconnect(generation);
        if broken {
            self.reconnect.notify_one();
        }
        broken
    }
}

/// Counter store backed by a shared Redis server.
pub struct RedisStore {
    shared: Arc<Shared>,
    command_timeout: Duration,
    increment_script: Script,
    expire_script: Script,
    supervisor: JoinHandle<()>,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.is_connected())
            .field("config", &self.config)
            .finish()
    }
}

impl RedisStore {
    /// Create the store and start its connection supervisor.
    ///
    /// Returns immediately; the first connection is established in the
    /// background. Must be called from within a Tokio runtime.
    pub fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unexpected(format!("invalid redis url: {e}")))?;

        let shared = Arc::new(Shared::new());
        let supervisor = tokio::spawn(supervise(client, shared.clone(), config.clone()));

        Ok(Self {
            shared,
            command_timeout: config.command_timeout,
            increment_script: Script::new(INCREMENT_WITH_TTL),
            expire_script: Script::new(EXPIRE_IF_UNSET),
            supervisor,
            config,
        })
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Wait up to `timeout` for a connection.
    ///
    /// Only used at startup for logging; the gate never blocks on this.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.shared.connected.subscribe();
        let up = matches!(
            tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        up
    }

    /// Run one command on the shared connection, bounded by the command timeout.
    async fn run<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let Connection { generation, conn } = self.shared.current().ok_or_else(|| {
            StoreError::Unavailable("connection not established".to_string())
        })?;

        match tokio::time::timeout(self.command_timeout, command(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.classify(operation, generation, e)),
            Err(_) => {
                // A connection that stops answering is as good as gone
                if self.shared.report_broken(generation) {
                    debug!(operation, generation, "Counter store command timed out, scheduling reconnect");
                }
                Err(StoreError::Unavailable(format!(
                    "{operation} timed out after {}ms",
                    self.command_timeout.as_millis()
                )))
            }
        }
    }

    /// Map a Redis error onto the store taxonomy, scheduling a reconnect when
    /// the connection itself is broken.
    fn classify(&self, operation: &'static str, generation: u64, err: RedisError) -> StoreError {
        if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            if self.shared.report_broken(generation) {
                debug!(operation, generation, error = %err, "Counter store connection failed, scheduling reconnect");
            }
            StoreError::Unavailable(format!("{operation}: {err}"))
        } else {
            StoreError::Unexpected(format!("{operation}: {err}"))
        }
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        let count = self
            .run("INCR", |mut conn| async move {
                let count: u64 = ::redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
                Ok(count)
            })
            .await?;
        trace!(count, "Incremented redis counter");
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let ttl_secs = ttl.as_secs().max(1);
        let script = self.expire_script.clone();
        let applied = self
            .run("EXPIRE", |mut conn| async move {
                let applied: i64 = script.key(&key).arg(ttl_secs).invoke_async(&mut conn).await?;
                Ok(applied)
            })
            .await?;
        Ok(applied == 1)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<Counted, StoreError> {
        let key = key.to_string();
        let ttl_secs = ttl.as_secs().max(1);
        let script = self.increment_script.clone();
        let count = self
            .run("INCR", |mut conn| async move {
                let count: u64 = script.key(&key).arg(ttl_secs).invoke_async(&mut conn).await?;
                Ok(count)
            })
            .await?;
        trace!(count, "Incremented redis counter");
        Ok(Counted {
            count,
            ttl_error: None,
        })
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Own the connection: establish it, replace it when broken, keep it alive.
async fn supervise(client: Client, shared: Arc<Shared>, config: RedisStoreConfig) {
    let mut generation = 0u64;

    loop {
        let Some(current) = shared.current() else {
            match tokio::time::timeout(
                config.connect_timeout,
                client.get_multiplexed_async_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    generation += 1;
                    shared.install(generation, conn);
                    info!(generation, "Connected to counter store");
                }
                Ok(Err(e)) => {
                    warn!(
                        error = %e,
                        retry_in_ms = config.reconnect_backoff.as_millis() as u64,
                        "Failed to connect to counter store"
                    );
                    tokio::time::sleep(config.reconnect_backoff).await;
                }
                Err(_) => {
                    warn!(
                        timeout_ms = config.connect_timeout.as_millis() as u64,
                        retry_in_ms = config.reconnect_backoff.as_millis() as u64,
                        "Timed out connecting to counter store"
                    );
                    tokio::time::sleep(config.reconnect_backoff).await;
                }
            }
            continue;
        };

        tokio::select! {
            _ = shared.reconnect.notified() => {
                // Permit left over from a connection that is already gone
                if shared.is_connected() {
                    continue;
                }
                warn!(generation = current.generation, "Counter store connection lost, reconnecting");
                tokio::time::sleep(config.reconnect_backoff).await;
            }
            _ = tokio::time::sleep(config.keepalive_interval) => {
                let mut conn = current.conn;
                match tokio::time::timeout(config.command_timeout, ping(&mut conn)).await {
                    Ok(Ok(_)) => debug!("Counter store ping OK"),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Counter store ping failed");
                        shared.disconnect(current.generation);
                    }
                    Err(_) => {
                        warn!("Counter store ping timed out");
                        shared.disconnect(current.generation);
                    }
                }
            }
        }
    }
}

async fn ping(conn: &mut MultiplexedConnection) -> RedisResult<String> {
    ::redis::cmd("PING").query_async(conn).await
}
