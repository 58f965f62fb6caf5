//! Coalescing access layer.
//!
//! [`UserService`] is the one place that decides how a user is read or
//! written: cache first for reads, storage first for writes, with every
//! public operation routed through a keyed single-flight group so that
//! identical concurrent calls share one execution.
//!
//! Cache failures never fail an operation. Reads treat them as misses and
//! writes log them and carry on.

mod error;
mod fence;
mod inflight;
mod trace;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, warn};
use userfront_core::{User, parse_user_id};
use userfront_storage::{DynUserStorage, StorageError};
use uuid::Uuid;

use crate::cache::{CacheError, CacheKey, DynUserCache};
use crate::metrics;

pub use error::ServiceError;
use fence::WriteFence;
pub use inflight::{InFlight, Role};
pub use trace::CacheStatus;
use trace::OperationTrace;

/// Correlation id and deadline carried by every access layer call.
///
/// Dropping the future of a call cancels the caller's wait; a shared
/// execution started on its behalf runs to completion for other waiters.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub correlation_id: Uuid,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            deadline: Instant::now() + timeout,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Tunables for [`UserService`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Lifetime of every cache entry written by the service.
    pub cache_ttl: Duration,
    /// Bound on a single storage call inside a shared execution.
    pub upstream_timeout: Duration,
    pub max_page_size: i64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(25),
            upstream_timeout: Duration::from_secs(5),
            max_page_size: 100,
        }
    }
}

/// One page of a keyset listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPage {
    pub users: Vec<User>,
    /// Id of the last user on the page; pass it back as the next offset.
    pub next_cursor: i64,
    /// Offset that lists the page before this one, clamped at zero.
    pub prev_cursor: i64,
}

impl UserPage {
    fn new(users: Vec<User>, limit: i64) -> Self {
        let (next_cursor, prev_cursor) = match (users.first(), users.last()) {
            (Some(first), Some(last)) => (last.id, (first.id - limit - 1).max(0)),
            _ => (0, 0),
        };
        Self {
            users,
            next_cursor,
            prev_cursor,
        }
    }
}

enum Lookup {
    Id(i64),
    Nickname(String),
}

impl Lookup {
    fn cache_key(&self) -> CacheKey {
        match self {
            Lookup::Id(id) => CacheKey::Id(*id),
            Lookup::Nickname(nickname) => CacheKey::Nickname(nickname.clone()),
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Lookup::Id(_) => "findByID",
            Lookup::Nickname(_) => "findByNickname",
        }
    }

    fn operand(&self) -> String {
        match self {
            Lookup::Id(id) => id.to_string(),
            Lookup::Nickname(nickname) => nickname.clone(),
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Id(id) => write!(f, "id={id}"),
            Lookup::Nickname(nickname) => write!(f, "nickname={nickname}"),
        }
    }
}

fn payload_hash(user: &User) -> u64 {
    let mut hasher = DefaultHasher::new();
    user.hash(&mut hasher);
    hasher.finish()
}

fn validate(user: &User) -> Result<(), ServiceError> {
    if user.nickname.trim().is_empty() {
        return Err(ServiceError::invalid("nickname must not be empty"));
    }
    Ok(())
}

/// Cache-aside access to user records.
///
/// Cheap to clone; clones share the in-flight groups and the background
/// task tracker.
#[derive(Clone)]
pub struct UserService {
    inner: Arc<Inner>,
}

struct Inner {
    storage: DynUserStorage,
    cache: DynUserCache,
    settings: ServiceSettings,
    users: InFlight<User>,
    pages: InFlight<Vec<User>>,
    removals: InFlight<()>,
    fence: Arc<WriteFence>,
    background: TaskTracker,
}

impl UserService {
    pub fn new(storage: DynUserStorage, cache: DynUserCache, settings: ServiceSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                cache,
                settings,
                users: InFlight::new(),
                pages: InFlight::new(),
                removals: InFlight::new(),
                fence: WriteFence::new(),
                background: TaskTracker::new(),
            }),
        }
    }

    pub fn storage(&self) -> &DynUserStorage {
        &self.inner.storage
    }

    pub fn cache(&self) -> &DynUserCache {
        &self.inner.cache
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.inner.settings
    }

    /// Number of executions currently shared across callers.
    pub fn in_flight(&self) -> usize {
        self.inner.users.in_flight() + self.inner.pages.in_flight() + self.inner.removals.in_flight()
    }

    /// Waits for background cache work (TTL refreshes, write-backs) spawned
    /// so far. New work may still be spawned afterwards.
    pub async fn drain(&self) {
        let background = &self.inner.background;
        background.close();
        background.wait().await;
        background.reopen();
    }

    pub async fn find_by_id(&self, ctx: &RequestContext, raw_id: &str) -> Result<User, ServiceError> {
        let id = parse_user_id(raw_id).map_err(|e| rejected("findByID", raw_id, ctx, e.into()))?;
        self.lookup(ctx, Lookup::Id(id), format!("getUserByID:{id}"))
            .await
    }

    pub async fn find_by_nickname(
        &self,
        ctx: &RequestContext,
        nickname: &str,
    ) -> Result<User, ServiceError> {
        if nickname.trim().is_empty() {
            let error = ServiceError::invalid("nickname must not be empty");
            return Err(rejected("findByNickname", nickname, ctx, error));
        }
        let key = format!("findByNickname:{nickname}");
        self.lookup(ctx, Lookup::Nickname(nickname.to_string()), key)
            .await
    }

    async fn lookup(
        &self,
        ctx: &RequestContext,
        lookup: Lookup,
        key: String,
    ) -> Result<User, ServiceError> {
        let operation = lookup.operation();
        let operand = lookup.operand();
        let inner = Arc::clone(&self.inner);
        let correlation_id = ctx.correlation_id;
        coalesced(&self.inner.users, ctx, operation, operand, key, move || {
            inner.load_user(lookup, correlation_id)
        })
        .await
    }

    /// Lists up to `limit` users with ids greater than `offset`.
    pub async fn find_all(
        &self,
        ctx: &RequestContext,
        limit: i64,
        offset: i64,
    ) -> Result<UserPage, ServiceError> {
        let operand = format!("limit={limit} offset={offset}");
        let max = self.inner.settings.max_page_size;
        if !(1..=max).contains(&limit) {
            let error = ServiceError::invalid(format!(
                "limit must be between 1 and {max}, got {limit}"
            ));
            return Err(rejected("findAll", operand, ctx, error));
        }
        if offset < 0 {
            let error = ServiceError::invalid(format!(
                "offset must not be negative, got {offset}"
            ));
            return Err(rejected("findAll", operand, ctx, error));
        }

        let inner = Arc::clone(&self.inner);
        let correlation_id = ctx.correlation_id;
        let key = format!("findAll:{limit}:{offset}");
        let users = coalesced(&self.inner.pages, ctx, "findAll", operand, key, move || {
            inner.load_page(limit, offset, correlation_id)
        })
        .await?;
        Ok(UserPage::new(users, limit))
    }

    /// Stores a new user and returns it with its generated id.
    pub async fn create(&self, ctx: &RequestContext, mut user: User) -> Result<User, ServiceError> {
        validate(&user).map_err(|e| rejected("createUser", user.nickname.as_str(), ctx, e))?;
        user.id = 0;
        let key = format!("createUser:{:016x}", payload_hash(&user));
        let operand = user.nickname.clone();
        let inner = Arc::clone(&self.inner);
        let correlation_id = ctx.correlation_id;
        coalesced(&self.inner.users, ctx, "createUser", operand, key, move || {
            inner.create_user(user, correlation_id)
        })
        .await
    }

    /// Replaces the user stored under `raw_id`.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        raw_id: &str,
        mut user: User,
    ) -> Result<User, ServiceError> {
        let id = parse_user_id(raw_id).map_err(|e| rejected("updateUser", raw_id, ctx, e.into()))?;
        validate(&user).map_err(|e| rejected("updateUser", raw_id, ctx, e))?;
        user.id = id;
        let key = format!("updateUser:{id}:{:016x}", payload_hash(&user));
        let inner = Arc::clone(&self.inner);
        let correlation_id = ctx.correlation_id;
        coalesced(&self.inner.users, ctx, "updateUser", id.to_string(), key, move || {
            inner.update_user(user, correlation_id)
        })
        .await
    }

    pub async fn delete(&self, ctx: &RequestContext, raw_id: &str) -> Result<(), ServiceError> {
        let id = parse_user_id(raw_id).map_err(|e| rejected("deleteUser", raw_id, ctx, e.into()))?;
        let inner = Arc::clone(&self.inner);
        let correlation_id = ctx.correlation_id;
        let key = format!("deleteUser:{id}");
        coalesced(&self.inner.removals, ctx, "deleteUser", id.to_string(), key, move || {
            inner.delete_user(id, correlation_id)
        })
        .await
    }
}

impl Inner {
    async fn load_user(self: Arc<Self>, lookup: Lookup, correlation_id: Uuid) -> Result<User, ServiceError> {
        let key = lookup.cache_key();
        let mut trace = OperationTrace::start(
            lookup.operation(),
            lookup.operand(),
            correlation_id,
            CacheStatus::Miss,
        );

        match self.cache.get(&key).await {
            Ok(user) => {
                trace.cache_status(CacheStatus::Hit);
                metrics::record_cache_hit();
                self.refresh_ttl(key);
                return Ok(user);
            }
            Err(e) => note_miss(&key, &e),
        }

        // Taken before storage so a write landing after this read is detected.
        let snapshot = self.fence.snapshot();
        let context = format!("find user {lookup}");
        let result = match &lookup {
            Lookup::Id(id) => self.bounded(&context, self.storage.find_one(*id)).await,
            Lookup::Nickname(nickname) => {
                self.bounded(&context, self.storage.find_one_by_nickname(nickname))
                    .await
            }
        };
        trace.record(&result);
        let user = result?;

        let cache = Arc::clone(&self.cache);
        let ttl = self.settings.cache_ttl;
        let value = user.clone();
        let target = key.clone();
        let (command, by_id) = match lookup {
            Lookup::Id(_) => ("set", true),
            Lookup::Nickname(_) => ("set_secondary", false),
        };
        self.in_background(command, key, async move {
            // A write to this user after the snapshot makes `value` suspect.
            if snapshot.is_stale(value.id) {
                debug!(key = %target, "user written since read, skipping write-back");
                return Ok(());
            }
            if by_id {
                cache.set(&value, ttl).await?;
            } else {
                cache.set_secondary(&value, ttl).await?;
            }
            if snapshot.is_stale(value.id) {
                debug!(key = %target, "user written during write-back, dropping entry");
                cache.del(&target).await?;
            }
            Ok::<_, CacheError>(())
        });
        Ok(user)
    }

    async fn load_page(
        self: Arc<Self>,
        limit: i64,
        offset: i64,
        correlation_id: Uuid,
    ) -> Result<Vec<User>, ServiceError> {
        let key = CacheKey::Page { limit, offset };
        let mut trace = OperationTrace::start(
            "findAll",
            format!("limit={limit} offset={offset}"),
            correlation_id,
            CacheStatus::Miss,
        );

        match self.cache.get_page(&key).await {
            Ok(users) => {
                trace.cache_status(CacheStatus::Hit);
                metrics::record_cache_hit();
                self.refresh_ttl(key);
                return Ok(users);
            }
            Err(e) => note_miss(&key, &e),
        }

        let context = format!("list users limit={limit} offset={offset}");
        let result = self
            .bounded(&context, self.storage.find_all(limit, offset))
            .await;
        trace.record(&result);
        let users = result?;

        let cache = Arc::clone(&self.cache);
        let ttl = self.settings.cache_ttl;
        let page = users.clone();
        let page_key = key.clone();
        self.in_background("set_page", key, async move {
            cache.set_page(&page_key, &page, ttl).await
        });
        Ok(users)
    }

    async fn create_user(self: Arc<Self>, mut user: User, correlation_id: Uuid) -> Result<User, ServiceError> {
        let mut trace = OperationTrace::start(
            "createUser",
            user.nickname.clone(),
            correlation_id,
            CacheStatus::NoUse,
        );

        let context = format!("create user nickname={}", user.nickname);
        let result = self.bounded(&context, self.storage.create(&mut user)).await;
        trace.record(&result);
        result?;

        let ttl = self.settings.cache_ttl;
        best_effort("set", &CacheKey::Id(user.id), self.cache.set(&user, ttl)).await;
        Ok(user)
    }

    async fn update_user(self: Arc<Self>, user: User, correlation_id: Uuid) -> Result<User, ServiceError> {
        let mut trace = OperationTrace::start(
            "updateUser",
            user.id.to_string(),
            correlation_id,
            CacheStatus::NoUse,
        );

        let context = format!("update user id={}", user.id);
        let result = self.bounded(&context, self.storage.update(&user)).await;
        trace.record(&result);
        let previous = result?;
        self.fence.stamp(user.id);

        let ttl = self.settings.cache_ttl;
        best_effort("set", &CacheKey::Id(user.id), self.cache.set(&user, ttl)).await;
        if previous.nickname != user.nickname {
            let stale = CacheKey::Nickname(previous.nickname);
            best_effort("del", &stale, self.cache.del(&stale)).await;
        }
        let secondary = CacheKey::Nickname(user.nickname.clone());
        best_effort("set_secondary", &secondary, self.cache.set_secondary(&user, ttl)).await;
        Ok(user)
    }

    async fn delete_user(self: Arc<Self>, id: i64, correlation_id: Uuid) -> Result<(), ServiceError> {
        let mut trace = OperationTrace::start(
            "deleteUser",
            id.to_string(),
            correlation_id,
            CacheStatus::NoUse,
        );

        let context = format!("delete user id={id}");
        let result = self.bounded(&context, self.storage.delete(id)).await;
        trace.record(&result);
        let deleted = result?;
        self.fence.stamp(id);

        let primary = CacheKey::Id(id);
        best_effort("del", &primary, self.cache.del(&primary)).await;
        let secondary = CacheKey::Nickname(deleted.nickname);
        best_effort("del", &secondary, self.cache.del(&secondary)).await;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        context: &str,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.settings.upstream_timeout, call).await {
            Ok(result) => result.map_err(|e| ServiceError::from_storage(context, e)),
            Err(_) => {
                warn!(
                    context,
                    timeout_ms = self.settings.upstream_timeout.as_millis() as u64,
                    "storage call timed out"
                );
                Err(ServiceError::DeadlineExceeded)
            }
        }
    }

    fn refresh_ttl(&self, key: CacheKey) {
        let cache = Arc::clone(&self.cache);
        let ttl = self.settings.cache_ttl;
        let target = key.clone();
        self.in_background("expire", key, async move { cache.expire(&target, ttl).await });
    }

    fn in_background<F>(&self, command: &'static str, key: CacheKey, effect: F)
    where
        F: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        self.background.spawn(
            async move {
                if let Err(e) = effect.await {
                    soft_failure(command, &key, &e);
                }
            }
            .instrument(Span::current()),
        );
    }
}

/// Runs `work` through `group`. Callers that attach to another caller's
/// execution get their own trace so their correlation id is logged.
async fn coalesced<T, F, Fut>(
    group: &InFlight<T>,
    ctx: &RequestContext,
    operation: &'static str,
    operand: String,
    key: String,
    work: F,
) -> Result<T, ServiceError>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
{
    let started = std::time::Instant::now();
    let (result, role) = group.run_as(key, ctx.deadline, work).await;
    if role == Role::Follower {
        let mut trace = OperationTrace::joined(operation, operand, ctx.correlation_id, started);
        trace.record(&result);
    }
    result
}

/// Records a call turned away before it reached an in-flight group.
fn rejected(
    operation: &'static str,
    operand: impl Into<String>,
    ctx: &RequestContext,
    error: ServiceError,
) -> ServiceError {
    let mut trace = OperationTrace::start(operation, operand, ctx.correlation_id, CacheStatus::NoUse);
    trace.record::<()>(&Err(error.clone()));
    error
}

async fn best_effort(
    command: &'static str,
    key: &CacheKey,
    effect: impl Future<Output = Result<(), CacheError>>,
) {
    if let Err(e) = effect.await {
        soft_failure(command, key, &e);
    }
}

fn note_miss(key: &CacheKey, error: &CacheError) {
    metrics::record_cache_miss();
    if error.is_miss() {
        debug!(key = %key, "cache miss");
    } else {
        soft_failure("get", key, error);
    }
}

fn soft_failure(command: &'static str, key: &CacheKey, error: &CacheError) {
    if error.is_miss() {
        debug!(command, key = %key, "cache key already gone");
        return;
    }
    metrics::record_cache_soft_failure(command);
    warn!(command, key = %key, error = %error, "cache command failed, continuing without cache");
}
