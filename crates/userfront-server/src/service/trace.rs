//! Per-operation log event and metrics.

use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use super::error::ServiceError;
use crate::metrics;

/// How an operation used the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Writes, which go to storage first.
    NoUse,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::NoUse => "NOUSE",
        }
    }
}

/// Emits one event and one metrics sample when dropped, whatever path the
/// operation took.
pub(crate) struct OperationTrace {
    operation: &'static str,
    operand: String,
    correlation_id: Uuid,
    cache_status: CacheStatus,
    outcome: &'static str,
    /// Set for callers served by another caller's execution.
    joined: bool,
    started: Instant,
}

impl OperationTrace {
    pub(crate) fn start(
        operation: &'static str,
        operand: impl Into<String>,
        correlation_id: Uuid,
        cache_status: CacheStatus,
    ) -> Self {
        Self {
            operation,
            operand: operand.into(),
            correlation_id,
            cache_status,
            outcome: "ok",
            joined: false,
            started: Instant::now(),
        }
    }

    /// Trace for a caller that attached to an execution already in flight.
    /// The execution's own trace carries the cache status.
    pub(crate) fn joined(
        operation: &'static str,
        operand: impl Into<String>,
        correlation_id: Uuid,
        started: Instant,
    ) -> Self {
        let mut trace = Self::start(operation, operand, correlation_id, CacheStatus::NoUse);
        trace.joined = true;
        trace.started = started;
        trace
    }

    pub(crate) fn cache_status(&mut self, status: CacheStatus) {
        self.cache_status = status;
    }

    pub(crate) fn record<T>(&mut self, result: &Result<T, ServiceError>) {
        self.outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
    }
}

impl Drop for OperationTrace {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        info!(
            operation = self.operation,
            operand = %self.operand,
            cache_status = self.cache_status.as_str(),
            outcome = self.outcome,
            joined = self.joined,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            correlation_id = %self.correlation_id,
            "user operation"
        );
        metrics::record_user_operation(
            self.operation,
            self.cache_status.as_str(),
            self.outcome,
            elapsed,
        );
    }
}
