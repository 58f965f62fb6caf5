//! Backend connection handles and their reconnect supervisor.
//!
//! Both the cache and the storage adapters keep exactly one live handle in a
//! [`ConnectionSlot`]. Request paths take a cheap `Arc` clone of the current
//! handle and never hold a lock across I/O. Only the [`KeepAlive`] task
//! replaces the handle:
//!
//! ```text
//! Live --(probe fails)--> Broken --(redial ok)--> Live
//!                          Broken --(redial fails)--> Broken   (retried every tick)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while establishing or probing a backend connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// No live handle is installed.
    #[error("{backend} connection is not established")]
    NotConnected { backend: &'static str },

    /// The backend did not answer in time.
    #[error("{backend} did not answer within {timeout_ms}ms")]
    Timeout {
        backend: &'static str,
        timeout_ms: u64,
    },

    /// Dialing or probing failed.
    #[error("{backend} connection failed: {message}")]
    Failed {
        backend: &'static str,
        message: String,
    },
}

impl ConnectError {
    #[must_use]
    pub fn failed(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            backend,
            message: message.into(),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::NotConnected { backend }
            | Self::Timeout { backend, .. }
            | Self::Failed { backend, .. } => backend,
        }
    }
}

/// Holder for a shared connection handle that may be absent (broken).
pub struct ConnectionSlot<H> {
    handle: ArcSwapOption<H>,
}

impl<H> ConnectionSlot<H> {
    /// A slot in the broken state.
    pub fn empty() -> Self {
        Self {
            handle: ArcSwapOption::empty(),
        }
    }

    pub fn new(handle: H) -> Self {
        Self {
            handle: ArcSwapOption::from_pointee(handle),
        }
    }

    /// Returns the live handle, if any.
    pub fn current(&self) -> Option<Arc<H>> {
        self.handle.load_full()
    }

    pub fn is_live(&self) -> bool {
        self.handle.load().is_some()
    }

    /// Installs a fresh handle and returns the one it replaced.
    pub fn install(&self, handle: H) -> Option<Arc<H>> {
        self.handle.swap(Some(Arc::new(handle)))
    }

    /// Marks the slot broken and returns the removed handle.
    pub fn take(&self) -> Option<Arc<H>> {
        self.handle.swap(None)
    }
}

impl<H> Default for ConnectionSlot<H> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<H> std::fmt::Debug for ConnectionSlot<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("live", &self.is_live())
            .finish()
    }
}

/// Knows how to open and check a connection to one backend.
#[async_trait]
pub trait Redial: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Opens a new connection.
    async fn dial(&self) -> Result<Self::Handle, ConnectError>;

    /// Liveness probe against an existing connection.
    async fn probe(&self, handle: &Self::Handle) -> Result<(), ConnectError>;

    /// Releases a handle that has been replaced or declared broken.
    async fn retire(&self, _handle: Arc<Self::Handle>) {}
}

/// Timing for the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// How often the handle is probed.
    pub poll_interval: Duration,
    /// Upper bound for a single probe or dial attempt.
    pub dial_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(1),
        }
    }
}

async fn bounded<T>(
    backend: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout {
            backend,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Dials once and installs the result, retiring any previous handle.
pub async fn dial_into<R: Redial>(
    redial: &R,
    slot: &ConnectionSlot<R::Handle>,
    dial_timeout: Duration,
) -> Result<(), ConnectError> {
    let handle = bounded(redial.backend(), dial_timeout, redial.dial()).await?;
    if let Some(previous) = slot.install(handle) {
        redial.retire(previous).await;
    }
    Ok(())
}

/// Probes the current handle. Used by health checks and by the supervisor.
pub async fn probe_slot<R: Redial>(
    redial: &R,
    slot: &ConnectionSlot<R::Handle>,
    limit: Duration,
) -> Result<(), ConnectError> {
    let backend = redial.backend();
    let handle = slot
        .current()
        .ok_or(ConnectError::NotConnected { backend })?;
    bounded(backend, limit, redial.probe(&handle)).await
}

/// Background task that keeps one [`ConnectionSlot`] populated.
///
/// The loop runs until the shutdown token is cancelled. Redial failures are
/// logged and retried on the next tick; they never end the loop.
#[derive(Debug)]
pub struct KeepAlive {
    backend: &'static str,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn<R: Redial>(
        redial: Arc<R>,
        slot: Arc<ConnectionSlot<R::Handle>>,
        config: KeepAliveConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let backend = redial.backend();
        let token = shutdown.child_token();
        let task = tokio::spawn(supervise(redial, slot, config, token.clone()));
        info!(
            backend,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "keep-alive started"
        );
        Self {
            backend,
            shutdown: token,
            task,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(backend = self.backend, error = %e, "keep-alive task ended abnormally");
        }
    }
}

async fn supervise<R: Redial>(
    redial: Arc<R>,
    slot: Arc<ConnectionSlot<R::Handle>>,
    config: KeepAliveConfig,
    shutdown: CancellationToken,
) {
    let backend = redial.backend();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the handle was just dialed.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(backend, "keep-alive stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let reason = match probe_slot(&*redial, &slot, config.dial_timeout).await {
            Ok(()) => continue,
            Err(e) => e,
        };

        // Request paths must not pick up a handle that failed its probe.
        if let Some(broken) = slot.take() {
            redial.retire(broken).await;
        }

        info!(backend, reason = %reason, "reconnecting");
        match dial_into(&*redial, &slot, config.dial_timeout).await {
            Ok(()) => info!(backend, "reconnected"),
            Err(e) => warn!(backend, error = %e, "reconnect failed, retrying on next tick"),
        }
    }
}
