//! Keyed single-flight execution.
//!
//! The first caller for a key spawns the work on the runtime and registers a
//! shared handle to its result. Callers arriving while it runs attach to that
//! handle instead of starting their own execution. Each caller waits under
//! its own deadline; giving up only detaches that caller; the execution
//! keeps running for the others.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug};

use super::error::ServiceError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ServiceError>>>;

struct Call<T> {
    generation: u64,
    result: SharedResult<T>,
}

/// How a caller took part in an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the execution.
    Leader,
    /// Attached to an execution another caller started.
    Follower,
}

/// Registry of executions currently in flight, keyed by operation and operands.
pub struct InFlight<T> {
    calls: Arc<DashMap<String, Call<T>>>,
    generations: AtomicU64,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with an execution outstanding.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    /// Runs `work` unless an execution for `key` is already outstanding, and
    /// waits for the shared result until `deadline`.
    ///
    /// `work` is only invoked by the caller that starts the execution.
    pub async fn run<F, Fut>(
        &self,
        key: String,
        deadline: Instant,
        work: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        self.run_as(key, deadline, work).await.0
    }

    /// Same as [`run`](Self::run), also reporting whether this caller
    /// started the execution.
    pub async fn run_as<F, Fut>(
        &self,
        key: String,
        deadline: Instant,
        work: F,
    ) -> (Result<T, ServiceError>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        let (shared, role) = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(key = %key, "joining in-flight call");
                (entry.get().result.clone(), Role::Follower)
            }
            Entry::Vacant(entry) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let calls = Arc::clone(&self.calls);
                let task_key = key.clone();
                let execution = work();

                let task = tokio::spawn(
                    async move {
                        let result = execution.await;
                        calls.remove_if(&task_key, |_, call| call.generation == generation);
                        result
                    }
                    .instrument(Span::current()),
                );

                let result: SharedResult<T> = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(ServiceError::internal(format!("in-flight task failed: {e}")))
                    })
                }
                .boxed()
                .shared();

                entry.insert(Call {
                    generation,
                    result: result.clone(),
                });
                (result, Role::Leader)
            }
        };

        let result = match tokio::time::timeout_at(deadline, shared).await {
            Ok(result) => result,
            Err(_) => {
                debug!(key = %key, "caller deadline reached while waiting");
                Err(ServiceError::DeadlineExceeded)
            }
        };
        (result, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let group = Arc::new(InFlight::<u32>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("answer".into(), far(), move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_shared_too() {
        let group = Arc::new(InFlight::<u32>::new());
        let first = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("k".into(), far(), || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(ServiceError::NotFound("user id=1".into()))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let (second, role) = group
            .run_as("k".into(), far(), || async { Ok(7) })
            .await;

        assert_eq!(role, Role::Follower);
        assert_eq!(second, Err(ServiceError::NotFound("user id=1".into())));
        assert_eq!(first.await.unwrap(), second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_deadline_does_not_cancel_execution() {
        let group = Arc::new(InFlight::<u32>::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let marker = finished.clone();
        let impatient = group
            .run(
                "slow".into(),
                Instant::now() + Duration::from_millis(10),
                move || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    marker.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                },
            )
            .await;
        assert_eq!(impatient, Err(ServiceError::DeadlineExceeded));
        assert_eq!(group.in_flight(), 1);

        // A patient caller attaches to the same execution.
        let patient = group.run("slow".into(), far(), || async { Ok(2) }).await;
        assert_eq!(patient, Ok(1));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_waves_execute_again() {
        let group = InFlight::<u32>::new();
        assert_eq!(
            group.run_as("k".into(), far(), || async { Ok(1) }).await,
            (Ok(1), Role::Leader)
        );
        tokio::task::yield_now().await;
        assert_eq!(group.run("k".into(), far(), || async { Ok(2) }).await, Ok(2));
    }
}
