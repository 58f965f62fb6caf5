pub mod cache;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod service;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use userfront_db_postgres::{PostgresUserStorage, pool::mask_password};
use userfront_storage::DynUserStorage;

pub use crate::cache::{CacheError, CacheKey, DynUserCache, InMemoryUserCache, RedisUserCache, UserCache};
pub use crate::config::{AppConfig, CacheConfig, RedisConfig, ServerConfig, StorageBackend};
pub use observability::init_tracing;
pub use server::{ServerBuilder, UserfrontServer, build_app, build_monitoring_app};
pub use service::{RequestContext, ServiceError, ServiceSettings, UserPage, UserService};

/// Create the storage Port selected by configuration.
///
/// PostgreSQL that cannot be reached yet still yields a storage; its
/// keep-alive task keeps dialing in the background.
pub async fn create_user_storage(cfg: &AppConfig, shutdown: CancellationToken) -> DynUserStorage {
    match cfg.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, data is lost on restart");
            userfront_db_memory::create_user_storage()
        }
        StorageBackend::Postgres => {
            tracing::info!(url = %mask_password(&cfg.storage.postgres.url), "Connecting to PostgreSQL");
            let (storage, _initial) =
                PostgresUserStorage::connect(cfg.storage.postgres.clone(), shutdown).await;
            Arc::new(storage)
        }
    }
}

/// Create the cache Port selected by configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: process-local cache (DashMap)
/// - **Redis enabled**: single multiplexed connection, redialed in the
///   background while the server is up
///
/// Only a malformed Redis URL is an error.
pub async fn create_user_cache(
    cfg: &AppConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<DynUserCache> {
    if !cfg.redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return Ok(Arc::new(InMemoryUserCache::new()));
    }

    tracing::info!(url = %mask_password(&cfg.redis.url), "Connecting to Redis");
    let (cache, _initial) = RedisUserCache::connect(cfg.redis_settings(), shutdown).await?;
    Ok(Arc::new(cache))
}
