//! Cache Port for user records.
//!
//! Two implementations share the [`UserCache`] contract:
//!
//! - [`RedisUserCache`]: a single multiplexed Redis connection repaired by a
//!   keep-alive task
//! - [`InMemoryUserCache`]: a process-local map, used when Redis is disabled
//!   and as a test double
//!
//! Values are stored as MessagePack. Every error is soft from the caller's
//! point of view: the access layer treats it as a miss and moves on.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use userfront_core::User;

pub use memory::InMemoryUserCache;
pub use redis::{RedisDialer, RedisSettings, RedisUserCache};

/// Type alias for a shareable cache instance.
pub type DynUserCache = Arc<dyn UserCache>;

/// Key spaces of the cache. Ids and nicknames never collide because each
/// space carries its own prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Id(i64),
    Nickname(String),
    Page { limit: i64, offset: i64 },
}

impl CacheKey {
    pub fn render(&self) -> String {
        match self {
            CacheKey::Id(id) => format!("user:id:{id}"),
            CacheKey::Nickname(nickname) => format!("user:nickname:{nickname}"),
            CacheKey::Page { limit, offset } => format!("users:page:{limit}:{offset}"),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,

    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache codec error: {0}")]
    Codec(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }
}

impl From<userfront_core::ConnectError> for CacheError {
    fn from(e: userfront_core::ConnectError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    rmp_serde::to_vec_named(value).map_err(|e| CacheError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    rmp_serde::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
}

/// Byte-level cache operations plus typed helpers for user records.
///
/// Implementors provide the raw commands; the typed methods encode and
/// decode on top of them.
#[async_trait]
pub trait UserCache: Send + Sync {
    /// Fetches raw bytes; `CacheError::Miss` when the key is absent or expired.
    async fn get_raw(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError>;

    /// Stores raw bytes with the given time-to-live.
    async fn set_raw(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration)
    -> Result<(), CacheError>;

    /// Resets the time-to-live without rewriting the value.
    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<(), CacheError>;

    async fn del(&self, key: &CacheKey) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Stops background work and drops the connection.
    async fn close(&self);

    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<User, CacheError> {
        let bytes = self.get_raw(key).await?;
        decode(&bytes)
    }

    async fn get_page(&self, key: &CacheKey) -> Result<Vec<User>, CacheError> {
        let bytes = self.get_raw(key).await?;
        decode(&bytes)
    }

    /// Writes the record under its id key.
    async fn set(&self, user: &User, ttl: Duration) -> Result<(), CacheError> {
        self.set_raw(&CacheKey::Id(user.id), encode(user)?, ttl).await
    }

    /// Writes the record under its nickname key.
    async fn set_secondary(&self, user: &User, ttl: Duration) -> Result<(), CacheError> {
        self.set_raw(&CacheKey::Nickname(user.nickname.clone()), encode(user)?, ttl)
            .await
    }

    async fn set_page(
        &self,
        key: &CacheKey,
        users: &[User],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.set_raw(key, encode(users)?, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_spaces_are_disjoint() {
        assert_eq!(CacheKey::Id(42).render(), "user:id:42");
        assert_eq!(CacheKey::Nickname("42".into()).render(), "user:nickname:42");
        assert_eq!(
            CacheKey::Page { limit: 10, offset: 0 }.render(),
            "users:page:10:0"
        );
        assert_ne!(
            CacheKey::Id(42).render(),
            CacheKey::Nickname("42".into()).render()
        );
    }

    #[test]
    fn test_codec_keeps_password_material() {
        let user = User::new("ann").with_id(1).with_password("secret");
        let bytes = encode(&user).unwrap();
        let decoded: User = decode(&bytes).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = decode::<User>(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, CacheError::Codec(_)));
        assert!(!err.is_miss());
    }
}
