use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellation signal with an optional deadline.
///
/// A `Context` bounds how long an operation, including all of its retries, may
/// run. Clones share the same cancellation state. Child contexts created with
/// [`Context::child_with_timeout`] are cancelled together with their parent and
/// never outlive its deadline, but cancelling a child leaves the parent alone.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never done unless cancelled.
    pub fn background() -> Self {
        Context {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires after `timeout`. A timeout too large to
    /// represent as an instant means no deadline at all.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::background(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derives a context that expires after `timeout`, or at this context's
    /// deadline if that comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, own) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        Context {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, or `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Reports whether the context is done, and why.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Runs `future` until it completes or the context is done.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, ContextError> {
        tokio::select! {
            biased;
            output = future => Ok(output),
            err = self.done() => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.remaining(), None);

        let result = ctx.run(tokio::time::sleep(Duration::from_secs(3600))).await;
        assert!(result.is_ok());
        assert_eq!(ctx.err(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(250));
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.remaining(), Some(Duration::from_millis(250)));

        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_is_bounded_by_parent_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(300));

        let short = parent.child_with_timeout(Duration::from_millis(100));
        assert_eq!(short.remaining(), Some(Duration::from_millis(100)));

        let long = parent.child_with_timeout(Duration::from_secs(5));
        assert_eq!(long.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let ctx = Context::with_timeout(Duration::MAX);
        assert_eq!(ctx.deadline(), None);
        assert_eq!(ctx.err(), None);

        let child = ctx.child_with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), None);

        let huge = Context::with_timeout(Duration::from_millis(u64::MAX));
        assert_eq!(huge.err(), None);
        assert_eq!(
            huge.child_with_timeout(Duration::from_millis(100)).remaining(),
            Some(Duration::from_millis(100))
        );

        let bounded = Context::with_timeout(Duration::from_secs(1));
        assert_eq!(
            bounded.child_with_timeout(Duration::MAX).deadline(),
            bounded.deadline()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_parent_cancels_child_only_downwards() {
        let parent = Context::background();
        let child = parent.child_with_timeout(Duration::from_secs(1));

        child.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(parent.err(), None);

        let other = parent.child_with_timeout(Duration::from_secs(1));
        parent.cancel();
        assert_eq!(other.err(), Some(ContextError::Cancelled));
        assert_eq!(other.done().await, ContextError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(ContextError::Cancelled));
    }
}
