//! Behaviour of the coalescing access layer over in-memory Ports.

use std::sync::Arc;
use std::time::Duration;

use userfront_core::User;
use userfront_db_memory::InMemoryUserStorage;
use async_trait::async_trait;
use userfront_server::cache::{CacheError, CacheKey, InMemoryUserCache, UserCache};
use userfront_server::{RequestContext, ServiceError, ServiceSettings, UserService};
use userfront_storage::UserStorage;

struct Harness {
    storage: Arc<InMemoryUserStorage>,
    cache: Arc<InMemoryUserCache>,
    service: UserService,
}

impl Harness {
    fn new() -> Self {
        Self::with(InMemoryUserStorage::new(), ServiceSettings::default())
    }

    fn with(storage: InMemoryUserStorage, settings: ServiceSettings) -> Self {
        let storage = Arc::new(storage);
        let cache = Arc::new(InMemoryUserCache::new());
        let service = UserService::new(storage.clone(), cache.clone(), settings);
        Self {
            storage,
            cache,
            service,
        }
    }

    async fn seed(&self, nickname: &str) -> User {
        let mut user = User::new(nickname)
            .with_name("First", "Last")
            .with_gender("f")
            .with_password("secret")
            .with_status(1);
        self.storage.create(&mut user).await.expect("seed");
        user
    }
}

/// Cache whose writes take `delay` to land.
struct SlowWrites {
    inner: Arc<InMemoryUserCache>,
    delay: Duration,
}

#[async_trait]
impl UserCache for SlowWrites {
    async fn get_raw(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_raw(key, value, ttl).await
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<(), CacheError> {
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.inner.del(key).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn backend_name(&self) -> &'static str {
        "slow-writes"
    }
}

/// Service over a cache whose writes land 100ms late.
async fn slow_write_service() -> (Arc<InMemoryUserStorage>, Arc<InMemoryUserCache>, UserService) {
    let storage = Arc::new(InMemoryUserStorage::new());
    let cache = Arc::new(InMemoryUserCache::new());
    let slow = Arc::new(SlowWrites {
        inner: cache.clone(),
        delay: Duration::from_millis(100),
    });
    let service = UserService::new(storage.clone(), slow, ServiceSettings::default());
    let mut ann = User::new("ann").with_name("Ann", "Lee");
    storage.create(&mut ann).await.unwrap();
    (storage, cache, service)
}

fn ctx() -> RequestContext {
    RequestContext::new(Duration::from_secs(5))
}

#[tokio::test]
async fn test_cold_and_warm_reads_return_same_record() {
    let h = Harness::new();
    let ann = h.seed("ann").await;

    let cold = h.service.find_by_id(&ctx(), "1").await.unwrap();
    h.service.drain().await;
    let warm = h.service.find_by_id(&ctx(), "1").await.unwrap();

    assert_eq!(cold, ann);
    assert_eq!(warm, ann);
    assert_eq!(h.cache.get(&CacheKey::Id(1)).await.unwrap(), ann);
    assert_eq!(h.storage.calls().reads, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_storage_read() {
    let h = Harness::with(
        InMemoryUserStorage::new().with_latency(Duration::from_millis(50)),
        ServiceSettings::default(),
    );
    let ann = h.seed("ann").await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            service.find_by_id(&ctx(), "1").await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(ann.clone()));
    }
    assert_eq!(h.storage.calls().reads, 1);
    assert_eq!(h.service.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hits_extend_ttl_without_changing_value() {
    let h = Harness::new();
    let ann = h.seed("ann").await;
    let ttl = h.service.settings().cache_ttl;

    h.service.find_by_id(&ctx(), "1").await.unwrap();
    h.service.drain().await;
    assert_eq!(h.cache.ttl_of(&CacheKey::Id(1)), Some(ttl));

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(h.service.find_by_id(&ctx(), "1").await.unwrap(), ann);
        h.service.drain().await;
        assert_eq!(h.cache.ttl_of(&CacheKey::Id(1)), Some(ttl));
    }

    // 60s have passed; without the refreshes the entry would be long gone.
    assert_eq!(h.storage.calls().reads, 1);
}

#[tokio::test]
async fn test_create_then_read() {
    let h = Harness::new();

    let created = h
        .service
        .create(&ctx(), User::new("ann").with_name("Ann", "Lee"))
        .await
        .unwrap();
    assert!(created.id > 0);
    assert!(h.cache.contains(&CacheKey::Id(created.id)));

    let read = h
        .service
        .find_by_id(&ctx(), &created.id.to_string())
        .await
        .unwrap();
    assert_eq!(read, created);
}

#[tokio::test]
async fn test_create_conflict() {
    let h = Harness::new();
    h.service.create(&ctx(), User::new("ann")).await.unwrap();

    let err = h
        .service
        .create(&ctx(), User::new("ann").with_status(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn test_delete_removes_both_keys() {
    let h = Harness::new();
    h.seed("ann").await;

    h.service.find_by_id(&ctx(), "1").await.unwrap();
    h.service.find_by_nickname(&ctx(), "ann").await.unwrap();
    h.service.drain().await;
    assert!(h.cache.contains(&CacheKey::Id(1)));
    assert!(h.cache.contains(&CacheKey::Nickname("ann".into())));

    h.service.delete(&ctx(), "1").await.unwrap();

    assert!(!h.cache.contains(&CacheKey::Id(1)));
    assert!(!h.cache.contains(&CacheKey::Nickname("ann".into())));
    assert!(matches!(
        h.service.find_by_id(&ctx(), "1").await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        h.service.find_by_nickname(&ctx(), "ann").await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        h.service.delete(&ctx(), "1").await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_moves_nickname_key() {
    let h = Harness::new();
    let ann = h.seed("ann").await;

    h.service.find_by_nickname(&ctx(), "ann").await.unwrap();
    h.service.drain().await;

    let mut renamed = ann.clone().with_status(9);
    renamed.nickname = "annie".into();
    let updated = h.service.update(&ctx(), "1", renamed.clone()).await.unwrap();
    assert_eq!(updated, renamed);

    assert!(!h.cache.contains(&CacheKey::Nickname("ann".into())));
    assert_eq!(
        h.cache.get(&CacheKey::Nickname("annie".into())).await.unwrap(),
        renamed
    );
    assert_eq!(h.cache.get(&CacheKey::Id(1)).await.unwrap(), renamed);

    assert!(matches!(
        h.service.find_by_nickname(&ctx(), "ann").await,
        Err(ServiceError::NotFound(_))
    ));
    assert_eq!(h.service.find_by_id(&ctx(), "1").await.unwrap(), renamed);
}

#[tokio::test]
async fn test_update_missing_user_is_not_found() {
    let h = Harness::new();
    let err = h
        .service
        .update(&ctx(), "7", User::new("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_cache_outage_is_soft() {
    let h = Harness::new();
    h.cache.set_failing(true);

    let ann = h.service.create(&ctx(), User::new("ann")).await.unwrap();
    assert_eq!(h.service.find_by_id(&ctx(), "1").await.unwrap(), ann);
    assert_eq!(h.service.find_by_nickname(&ctx(), "ann").await.unwrap(), ann);

    let page = h.service.find_all(&ctx(), 10, 0).await.unwrap();
    assert_eq!(page.users, vec![ann.clone()]);

    let renamed = User::new("annie").with_id(1);
    assert_eq!(
        h.service.update(&ctx(), "1", renamed.clone()).await.unwrap(),
        renamed
    );
    h.service.delete(&ctx(), "1").await.unwrap();
    h.service.drain().await;

    // Every read went to storage.
    assert_eq!(h.storage.calls().reads, 2);
    assert_eq!(h.storage.calls().lists, 1);
    assert!(h.storage.is_empty().await);
}

#[tokio::test]
async fn test_find_and_delete_scenario() {
    let h = Harness::new();
    let ann = h.seed("ann").await;
    assert_eq!(ann.id, 1);

    let found = h.service.find_by_id(&ctx(), "1").await.unwrap();
    assert_eq!(found, ann);
    h.service.drain().await;
    assert_eq!(h.cache.get(&CacheKey::Id(1)).await.unwrap(), ann);

    h.service.delete(&ctx(), "1").await.unwrap();
    assert!(matches!(
        h.service.find_by_id(&ctx(), "1").await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_operands_never_reach_storage() {
    let h = Harness::new();

    for raw in ["abc", "0", "-4", ""] {
        assert!(matches!(
            h.service.find_by_id(&ctx(), raw).await,
            Err(ServiceError::Invalid(_))
        ));
    }
    assert!(matches!(
        h.service.find_by_nickname(&ctx(), " ").await,
        Err(ServiceError::Invalid(_))
    ));
    assert!(matches!(
        h.service.find_all(&ctx(), 0, 0).await,
        Err(ServiceError::Invalid(_))
    ));
    assert!(matches!(
        h.service.find_all(&ctx(), 10, -1).await,
        Err(ServiceError::Invalid(_))
    ));
    assert!(matches!(
        h.service.create(&ctx(), User::new("")).await,
        Err(ServiceError::Invalid(_))
    ));
    assert!(matches!(
        h.service.delete(&ctx(), "x").await,
        Err(ServiceError::Invalid(_))
    ));

    assert_eq!(h.storage.calls(), Default::default());
}

#[tokio::test]
async fn test_storage_outage_is_retryable_and_not_cached() {
    let h = Harness::new();
    h.seed("ann").await;
    h.storage.set_available(false);

    let err = h.service.find_by_id(&ctx(), "1").await.unwrap_err();
    assert!(matches!(err, ServiceError::Unavailable { ref backend, .. } if backend == "memory"));
    assert!(err.is_retryable());

    let missing = h.service.find_by_id(&ctx(), "99").await.unwrap_err();
    assert!(missing.is_retryable());

    h.service.drain().await;
    assert!(h.cache.is_empty());

    h.storage.set_available(true);
    tokio_test::assert_ok!(h.service.find_by_id(&ctx(), "1").await);
}

#[tokio::test]
async fn test_not_found_is_not_cached() {
    let h = Harness::new();

    assert!(matches!(
        h.service.find_by_id(&ctx(), "99").await,
        Err(ServiceError::NotFound(_))
    ));
    h.service.drain().await;
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_find_all_pages_and_cursors() {
    let h = Harness::new();
    for name in ["a", "b", "c", "d", "e"] {
        h.seed(name).await;
    }

    let first = h.service.find_all(&ctx(), 2, 0).await.unwrap();
    assert_eq!(first.users.iter().map(|u| u.id).collect::<Vec<_>>(), [1, 2]);
    assert_eq!((first.next_cursor, first.prev_cursor), (2, 0));

    let second = h.service.find_all(&ctx(), 2, first.next_cursor).await.unwrap();
    assert_eq!(second.users.iter().map(|u| u.id).collect::<Vec<_>>(), [3, 4]);
    assert_eq!((second.next_cursor, second.prev_cursor), (4, 0));

    let last = h.service.find_all(&ctx(), 2, second.next_cursor).await.unwrap();
    assert_eq!(last.users.iter().map(|u| u.id).collect::<Vec<_>>(), [5]);
    assert_eq!((last.next_cursor, last.prev_cursor), (5, 2));

    let past_end = h.service.find_all(&ctx(), 2, 5).await.unwrap();
    assert!(past_end.users.is_empty());
    assert_eq!((past_end.next_cursor, past_end.prev_cursor), (0, 0));

    h.service.drain().await;
    let again = h.service.find_all(&ctx(), 2, 0).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(h.storage.calls().lists, 4);
}

#[tokio::test(start_paused = true)]
async fn test_impatient_caller_leaves_execution_running() {
    let settings = ServiceSettings {
        upstream_timeout: Duration::from_secs(30),
        ..ServiceSettings::default()
    };
    let h = Harness::with(
        InMemoryUserStorage::new().with_latency(Duration::from_secs(2)),
        settings,
    );
    let ann = h.seed("ann").await;

    let impatient = RequestContext::new(Duration::from_millis(100));
    assert_eq!(
        h.service.find_by_id(&impatient, "1").await,
        Err(ServiceError::DeadlineExceeded)
    );
    assert_eq!(h.service.in_flight(), 1);

    let patient = RequestContext::new(Duration::from_secs(10));
    assert_eq!(h.service.find_by_id(&patient, "1").await, Ok(ann));
    assert_eq!(h.storage.calls().reads, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_storage_hits_upstream_timeout() {
    let settings = ServiceSettings {
        upstream_timeout: Duration::from_millis(500),
        ..ServiceSettings::default()
    };
    let h = Harness::with(
        InMemoryUserStorage::new().with_latency(Duration::from_secs(2)),
        settings,
    );
    h.seed("ann").await;

    let err = h.service.find_by_id(&ctx(), "1").await.unwrap_err();
    assert_eq!(err, ServiceError::DeadlineExceeded);
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_delete_wins_over_pending_write_back() {
    let (_storage, cache, service) = slow_write_service().await;

    assert_eq!(service.find_by_id(&ctx(), "1").await.unwrap().id, 1);
    service.delete(&ctx(), "1").await.unwrap();
    service.drain().await;

    assert!(!cache.contains(&CacheKey::Id(1)));
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(matches!(
            service.find_by_id(&ctx(), "1").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn test_rename_wins_over_pending_nickname_write_back() {
    let (_storage, cache, service) = slow_write_service().await;

    let ann = service.find_by_nickname(&ctx(), "ann").await.unwrap();
    let mut renamed = ann.clone();
    renamed.nickname = "annie".into();
    service.update(&ctx(), "1", renamed.clone()).await.unwrap();
    service.drain().await;

    assert!(!cache.contains(&CacheKey::Nickname("ann".into())));
    assert!(matches!(
        service.find_by_nickname(&ctx(), "ann").await,
        Err(ServiceError::NotFound(_))
    ));
    assert_eq!(service.find_by_id(&ctx(), "1").await.unwrap(), renamed);
}

#[tokio::test(start_paused = true)]
async fn test_update_is_not_overwritten_by_older_read() {
    let (_storage, cache, service) = slow_write_service().await;

    let ann = service.find_by_id(&ctx(), "1").await.unwrap();
    let promoted = ann.clone().with_status(7);
    service.update(&ctx(), "1", promoted.clone()).await.unwrap();
    service.drain().await;

    // The older read's value never stays behind in the cache.
    if let Ok(cached) = cache.get(&CacheKey::Id(1)).await {
        assert_eq!(cached, promoted);
    }
    assert_eq!(service.find_by_id(&ctx(), "1").await.unwrap(), promoted);
}
