//! Redis adapter for the cache Port.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use userfront_core::{
    ConnectError, ConnectionSlot, KeepAlive, KeepAliveConfig, Redial, dial_into, probe_slot,
};

use super::{CacheError, CacheKey, UserCache};

const BACKEND: &str = "redis";

/// Connection settings for [`RedisUserCache`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    /// Bounds each dial and each keep-alive probe.
    pub dial_timeout: Duration,
    /// Bounds every command issued on the request path.
    pub command_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dial_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(3),
        }
    }

    fn keepalive(&self) -> KeepAliveConfig {
        KeepAliveConfig {
            poll_interval: self.keepalive_interval,
            dial_timeout: self.dial_timeout,
        }
    }
}

/// Dials multiplexed connections for the keep-alive supervisor.
pub struct RedisDialer {
    client: redis::Client,
}

impl RedisDialer {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Backend(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

async fn ping(conn: &MultiplexedConnection) -> Result<(), RedisError> {
    let mut conn = conn.clone();
    let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

#[async_trait]
impl Redial for RedisDialer {
    type Handle = MultiplexedConnection;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn dial(&self) -> Result<MultiplexedConnection, ConnectError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConnectError::failed(BACKEND, e.to_string()))?;
        ping(&conn)
            .await
            .map_err(|e| ConnectError::failed(BACKEND, e.to_string()))?;
        Ok(conn)
    }

    async fn probe(&self, conn: &MultiplexedConnection) -> Result<(), ConnectError> {
        ping(conn)
            .await
            .map_err(|e| ConnectError::failed(BACKEND, e.to_string()))
    }
}

fn command_error(command: &'static str, e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        CacheError::Unavailable(format!("{command}: {e}"))
    } else {
        CacheError::Backend(format!("{command}: {e}"))
    }
}

/// Redis-backed user cache.
///
/// Request-path commands clone the multiplexed connection out of the slot,
/// so a reconnect never waits on in-flight commands and vice versa.
pub struct RedisUserCache {
    slot: Arc<ConnectionSlot<MultiplexedConnection>>,
    dialer: Arc<RedisDialer>,
    keepalive: Mutex<Option<KeepAlive>>,
    settings: RedisSettings,
}

impl RedisUserCache {
    /// Dials Redis and starts the keep-alive task.
    ///
    /// Only a malformed URL fails. An unreachable server leaves the cache
    /// broken until the keep-alive task gets through; the first dial error
    /// is returned for logging.
    pub async fn connect(
        settings: RedisSettings,
        shutdown: CancellationToken,
    ) -> Result<(Self, Option<CacheError>), CacheError> {
        let dialer = Arc::new(RedisDialer::new(&settings.url)?);
        let slot = Arc::new(ConnectionSlot::empty());

        let initial = dial_into(&*dialer, &slot, settings.dial_timeout)
            .await
            .err()
            .map(CacheError::from);
        match &initial {
            None => info!(backend = BACKEND, "cache connected"),
            Some(e) => warn!(backend = BACKEND, error = %e, "cache unreachable at startup"),
        }

        let keepalive = KeepAlive::spawn(
            dialer.clone(),
            slot.clone(),
            settings.keepalive(),
            shutdown,
        );

        let cache = Self {
            slot,
            dialer,
            keepalive: Mutex::new(Some(keepalive)),
            settings,
        };
        Ok((cache, initial))
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_live()
    }

    async fn command<T, F, Fut>(&self, name: &'static str, run: F) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let conn = self
            .slot
            .current()
            .ok_or(ConnectError::NotConnected { backend: BACKEND })?;
        let limit = self.settings.command_timeout;
        match tokio::time::timeout(limit, run((*conn).clone())).await {
            Ok(result) => result.map_err(|e| command_error(name, e)),
            Err(_) => Err(CacheError::Unavailable(format!(
                "{name}: timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl UserCache for RedisUserCache {
    async fn get_raw(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        let key = key.render();
        let value = self
            .command("GET", |mut conn| async move {
                conn.get::<_, Option<Vec<u8>>>(key).await
            })
            .await?;
        value.ok_or(CacheError::Miss)
    }

    async fn set_raw(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = key.render();
        let ttl_ms = millis(ttl);
        self.command("PSETEX", |mut conn| async move {
            conn.pset_ex::<_, _, ()>(key, value, ttl_ms).await
        })
        .await
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<(), CacheError> {
        let rendered = key.render();
        let ttl_ms = millis(ttl) as i64;
        let applied = self
            .command("PEXPIRE", |mut conn| async move {
                conn.pexpire::<_, bool>(rendered, ttl_ms).await
            })
            .await?;
        if applied {
            Ok(())
        } else {
            debug!(key = %key, "expire on absent key");
            Err(CacheError::Miss)
        }
    }

    async fn del(&self, key: &CacheKey) -> Result<(), CacheError> {
        let key = key.render();
        self.command("DEL", |mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        probe_slot(&*self.dialer, &self.slot, self.settings.command_timeout)
            .await
            .map_err(CacheError::from)
    }

    async fn close(&self) {
        if let Some(keepalive) = self.keepalive.lock().await.take() {
            keepalive.shutdown().await;
        }
        self.slot.take();
        info!(backend = BACKEND, "cache closed");
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            RedisDialer::new("not a url"),
            Err(CacheError::Backend(_))
        ));
    }

    #[test]
    fn test_ttl_rounds_up_to_one_millisecond() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(25)), 25_000);
    }

    #[tokio::test]
    async fn test_unreachable_server_starts_broken() {
        let settings = RedisSettings {
            url: "redis://127.0.0.1:1".into(),
            dial_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(3),
        };

        let (cache, initial) = RedisUserCache::connect(settings, CancellationToken::new())
            .await
            .expect("valid url");

        assert!(matches!(initial, Some(CacheError::Unavailable(_))));
        assert!(!cache.is_connected());
        assert!(matches!(
            cache.get_raw(&CacheKey::Id(1)).await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.ping().await.is_err());

        cache.close().await;
    }
}
