use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use userfront_storage::{StorageError, USER_ENTITY, User, UserStorage};

const BACKEND: &str = "memory";

/// Snapshot of how many times each storage operation was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: usize,
    pub reads: usize,
    pub lists: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    creates: AtomicUsize,
    reads: AtomicUsize,
    lists: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

/// In-memory user storage.
///
/// Users are kept in a `BTreeMap` ordered by id so keyset pagination
/// matches the SQL backend. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct InMemoryUserStorage {
    users: RwLock<BTreeMap<i64, User>>,
    next_id: AtomicI64,
    available: AtomicBool,
    latency: Option<Duration>,
    counters: Counters,
}

impl Default for InMemoryUserStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUserStorage {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
            latency: None,
            counters: Counters::default(),
        }
    }

    /// Adds an artificial delay to every call, useful for holding an
    /// operation in flight while concurrent callers pile up.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Switches the simulated connection on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            creates: self.counters.creates.load(Ordering::SeqCst),
            reads: self.counters.reads.load(Ordering::SeqCst),
            lists: self.counters.lists.load(Ordering::SeqCst),
            updates: self.counters.updates.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    /// Number of stored users.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<(), StorageError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::unavailable(BACKEND, "simulated outage"))
        }
    }
}

fn nickname_taken(users: &BTreeMap<i64, User>, nickname: &str, except: i64) -> bool {
    users
        .values()
        .any(|u| u.id != except && u.nickname == nickname)
}

#[async_trait]
impl UserStorage for InMemoryUserStorage {
    async fn create(&self, user: &mut User) -> Result<(), StorageError> {
        self.enter(&self.counters.creates).await?;
        let mut users = self.users.write().await;
        if nickname_taken(&users, &user.nickname, 0) {
            return Err(StorageError::already_exists(
                USER_ENTITY,
                format!("nickname={}", user.nickname),
            ));
        }
        user.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_one(&self, id: i64) -> Result<User, StorageError> {
        self.enter(&self.counters.reads).await?;
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(USER_ENTITY, format!("id={id}")))
    }

    async fn find_one_by_nickname(&self, nickname: &str) -> Result<User, StorageError> {
        self.enter(&self.counters.reads).await?;
        self.users
            .read()
            .await
            .values()
            .find(|u| u.nickname == nickname)
            .cloned()
            .ok_or_else(|| StorageError::not_found(USER_ENTITY, format!("nickname={nickname}")))
    }

    async fn find_all(&self, limit: i64, offset: i64) -> Result<Vec<User>, StorageError> {
        self.enter(&self.counters.lists).await?;
        let take = usize::try_from(limit).unwrap_or(0);
        let users = self.users.read().await;
        Ok(users
            .range(offset.saturating_add(1)..)
            .take(take)
            .map(|(_, u)| u.clone())
            .collect())
    }

    async fn update(&self, user: &User) -> Result<User, StorageError> {
        self.enter(&self.counters.updates).await?;
        let mut users = self.users.write().await;
        if !users.contains_key(&user.id) {
            return Err(StorageError::not_found(USER_ENTITY, format!("id={}", user.id)));
        }
        if nickname_taken(&users, &user.nickname, user.id) {
            return Err(StorageError::already_exists(
                USER_ENTITY,
                format!("nickname={}", user.nickname),
            ));
        }
        users
            .insert(user.id, user.clone())
            .ok_or_else(|| StorageError::internal("user vanished during update"))
    }

    async fn delete(&self, id: i64) -> Result<User, StorageError> {
        self.enter(&self.counters.deletes).await?;
        self.users
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StorageError::not_found(USER_ENTITY, format!("id={id}")))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_available()
    }

    async fn close(&self) {}

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
