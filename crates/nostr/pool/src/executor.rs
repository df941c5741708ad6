//! Deadline and cancellation for one query.
//!
//! Each query gets a [`QueryContext`] whose token fires on the earliest of
//! its deadline, the caller's cancellation token, or shutdown of the pool
//! that runs it. Every per-relay subscription of the query listens to that
//! one token.

use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Per-call query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the pool's default query timeout
    pub timeout: Option<Duration>,
    /// Cancelled by the caller to abandon the query
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Why a query stopped before every relay finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Deadline,
    Caller,
    Shutdown,
}

#[derive(Debug)]
pub struct QueryContext {
    token: CancellationToken,
    caller: CancellationToken,
    shutdown: CancellationToken,
    timeout: Duration,
    deadline: Instant,
}

impl QueryContext {
    /// `shutdown` is the owning pool's token.
    pub fn new(shutdown: &CancellationToken, options: &QueryOptions, default_timeout: Duration) -> Self {
        let timeout = options.timeout.unwrap_or(default_timeout);
        Self {
            token: shutdown.child_token(),
            caller: options.cancel.clone().unwrap_or_else(CancellationToken::new),
            shutdown: shutdown.clone(),
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Token shared by every per-relay subscription of this query.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Resolves when the query must stop, firing the shared token first.
    pub async fn cancelled(&self) -> CancelReason {
        let reason = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => CancelReason::Shutdown,
            _ = self.caller.cancelled() => CancelReason::Caller,
            _ = sleep_until(self.deadline) => CancelReason::Deadline,
            // Cancelled directly, e.g. by a parent that is not the pool.
            _ = self.token.cancelled() => CancelReason::Shutdown,
        };
        self.token.cancel();
        reason
    }

    /// Fire the shared token without a reason, e.g. when the query finishes.
    pub fn finish(&self) {
        self.token.cancel();
    }
}

impl Drop for QueryContext {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_token() {
        let pool = CancellationToken::new();
        let ctx = QueryContext::new(&pool, &QueryOptions::new(), Duration::from_secs(3));
        assert_eq!(ctx.timeout(), Duration::from_secs(3));

        let reason = ctx.cancelled().await;
        assert_eq!(reason, CancelReason::Deadline);
        assert!(ctx.token().is_cancelled());
        assert!(!pool.is_cancelled());
    }

    #[tokio::test]
    async fn test_caller_cancel() {
        let pool = CancellationToken::new();
        let caller = CancellationToken::new();
        let options = QueryOptions::new()
            .timeout(Duration::from_secs(60))
            .cancel_token(caller.clone());
        let ctx = QueryContext::new(&pool, &options, Duration::from_secs(3));

        caller.cancel();
        assert_eq!(ctx.cancelled().await, CancelReason::Caller);
        assert!(ctx.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_pool_shutdown_wins() {
        let pool = CancellationToken::new();
        let ctx = QueryContext::new(&pool, &QueryOptions::new(), Duration::from_secs(3));
        pool.cancel();
        assert!(ctx.token().is_cancelled());
        assert_eq!(ctx.cancelled().await, CancelReason::Shutdown);
    }

    #[tokio::test]
    async fn test_drop_cancels_token() {
        let pool = CancellationToken::new();
        let ctx = QueryContext::new(&pool, &QueryOptions::new(), Duration::from_secs(3));
        let token = ctx.token().clone();
        drop(ctx);
        assert!(token.is_cancelled());
    }
}
