//! Automatic retries for requests to a device on the local network.
//!
//! Requests to a controller on the LAN are usually answered within a few
//! milliseconds, but they regularly get lost or hang. [`Retrier`] therefore
//! gives every attempt a strict timeout and tries again with a longer one
//! whenever an attempt times out, until the request succeeds, fails for a
//! reason other than a timeout, or the caller's [`Context`] is done.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use log::debug;
use thiserror::Error;
use tokio::time::Instant;

use crate::util::context::{Context, ContextError};
use crate::util::traits::Tracer;

pub const BASE_TIMEOUT: Duration = Duration::from_millis(100);
pub const BACKOFF_MULTIPLIER: f64 = 1.5;
pub const MAX_TIMEOUT: Duration = Duration::from_secs(5);

/// A single attempt ran into its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("attempt timed out after {timeout:?}")]
pub struct AttemptTimeout {
    pub timeout: Duration,
}

/// Per-attempt timeout schedule.
///
/// The timeout for attempt `k` (0-indexed) is `min(base_timeout * multiplier^k, max_timeout)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_timeout: Duration,
    pub multiplier: f64,
    pub max_timeout: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base_timeout: BASE_TIMEOUT,
            multiplier: BACKOFF_MULTIPLIER,
            max_timeout: MAX_TIMEOUT,
        }
    }
}

impl Backoff {
    /// The timeout to use after an attempt with `timeout` timed out.
    ///
    /// A multiplier that gives no representable duration (negative, NaN or
    /// too large) yields `max_timeout`.
    pub fn next(&self, timeout: Duration) -> Duration {
        Duration::try_from_secs_f64(timeout.as_secs_f64() * self.multiplier)
            .map_or(self.max_timeout, |next| next.min(self.max_timeout))
    }
}

/// Reports whether `err` should cause another try.
///
/// Only timeouts are retried: an attempt running out of its own time, or the
/// transport giving up on a slow connection. A done umbrella [`Context`] is
/// not retryable; the retry loop checks for it separately. Any other error
/// is probably permanent.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.is::<AttemptTimeout>() {
            return true;
        }
        if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
            return err.is_timeout();
        }
        if let Some(err) = cause.downcast_ref::<io::Error>() {
            return err.kind() == io::ErrorKind::TimedOut;
        }
        false
    })
}

/// Runs operations with escalating per-attempt timeouts.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
pub struct Retrier {
    backoff: Backoff,
    #[derivative(Debug = "ignore")]
    tracer: Option<Arc<dyn Tracer>>,
}

impl Retrier {
    pub fn new(backoff: Backoff) -> Self {
        Retrier {
            backoff,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Option<Arc<dyn Tracer>>) -> Self {
        self.tracer = tracer;
        self
    }

    fn tracef(&self, ctx: &Context, line: fmt::Arguments<'_>) {
        if let Some(tracer) = &self.tracer {
            tracer.trace(ctx, line);
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or `ctx` is done.
    ///
    /// Every attempt gets a child of `ctx` that expires after the current
    /// per-attempt timeout. The loop enforces that deadline by dropping the
    /// attempt's future, so an attempt that ignores its context still ends
    /// with an [`AttemptTimeout`].
    ///
    /// When an attempt fails with a retryable error after `ctx` is done, the
    /// [`ContextError`] of `ctx` is returned instead of the attempt's error.
    pub async fn run<T, F, Fut>(&self, ctx: &Context, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let mut timeout = self.backoff.base_timeout;
        self.tracef(
            ctx,
            format_args!("Nanoleaf operation starting with timeout {:?}", timeout),
        );
        loop {
            debug!("Trying operation with timeout={:?}", timeout);
            let sub = ctx.child_with_timeout(timeout);
            let result = attempt(&sub, timeout, op(sub.clone())).await;
            sub.cancel();

            match result {
                Err(err) if is_retryable(&err) => {
                    if let Some(done) = ctx.err() {
                        // Give up on the overall effort.
                        self.tracef(
                            ctx,
                            format_args!(
                                "Nanoleaf operation giving up after {:?}",
                                started.elapsed()
                            ),
                        );
                        debug!("Giving up after {:?}: {}", started.elapsed(), done);
                        return Err(done.into());
                    }
                    debug!("Attempt with timeout={:?} failed: {:#}", timeout, err);
                    timeout = self.backoff.next(timeout);
                }
                result => {
                    // Success, or a non-timeout failure.
                    self.tracef(
                        ctx,
                        format_args!("Nanoleaf operation finished after {:?}", started.elapsed()),
                    );
                    debug!("Operation took {:?}", started.elapsed());
                    return result;
                }
            }
        }
    }
}

async fn attempt<T, Fut>(sub: &Context, timeout: Duration, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match sub.run(fut).await {
        Ok(result) => result,
        Err(ContextError::DeadlineExceeded) => Err(AttemptTimeout { timeout }.into()),
        Err(err @ ContextError::Cancelled) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, Context as _};

    use super::*;

    fn timed_out() -> anyhow::Error {
        anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
            .context("making HTTP request")
    }

    #[test]
    fn test_default_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_timeout, Duration::from_millis(100));
        assert_eq!(backoff.max_timeout, Duration::from_secs(5));
        assert!((backoff.multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_next_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.next(Duration::from_millis(100)), Duration::from_millis(150));
        assert_eq!(backoff.next(Duration::from_millis(150)), Duration::from_millis(225));
        assert_eq!(backoff.next(Duration::from_secs(4)), Duration::from_secs(5));
        assert_eq!(backoff.next(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_with_unusable_multiplier_jumps_to_cap() {
        for multiplier in [-1.5, f64::NAN, f64::INFINITY, f64::MAX] {
            let backoff = Backoff {
                multiplier,
                ..Backoff::default()
            };
            assert_eq!(
                backoff.next(Duration::from_millis(100)),
                MAX_TIMEOUT,
                "multiplier {multiplier}"
            );
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&anyhow::Error::new(AttemptTimeout {
            timeout: BASE_TIMEOUT
        })));
        assert!(is_retryable(&timed_out()));
        assert!(is_retryable(
            &anyhow::Error::new(AttemptTimeout {
                timeout: BASE_TIMEOUT
            })
            .context("making HTTP request")
        ));
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!is_retryable(&anyhow::Error::new(
            ContextError::DeadlineExceeded
        )));
        assert!(!is_retryable(&anyhow::Error::new(ContextError::Cancelled)));
        assert!(!is_retryable(
            &anyhow::Error::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused"
            ))
            .context("making HTTP request")
        ));
        assert!(!is_retryable(&anyhow!("malformed request")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_attempt() {
        let calls = AtomicU32::new(0);

        let result = Retrier::default()
            .run(&Context::background(), |_sub| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_escalate_until_success() {
        const FAILURES: usize = 13;
        let timeouts = Mutex::new(Vec::new());

        let result = Retrier::default()
            .run(&Context::background(), |sub| {
                let mut seen = timeouts.lock().unwrap();
                seen.push(sub.remaining().unwrap());
                let attempt = seen.len();
                async move {
                    if attempt <= FAILURES {
                        Err(timed_out())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        let timeouts = timeouts.into_inner().unwrap();
        assert_eq!(timeouts.len(), FAILURES + 1);

        let mut expected = BASE_TIMEOUT;
        for (k, timeout) in timeouts.iter().enumerate() {
            assert_eq!(*timeout, expected, "attempt {k}");
            let closed_form = BASE_TIMEOUT
                .mul_f64(BACKOFF_MULTIPLIER.powi(k as i32))
                .min(MAX_TIMEOUT);
            let drift = closed_form.max(*timeout) - closed_form.min(*timeout);
            assert!(
                drift < Duration::from_micros(1),
                "attempt {k}: {timeout:?} vs {closed_form:?}"
            );
            expected = Backoff::default().next(expected);
        }
        assert!(timeouts.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(timeouts.last(), Some(&MAX_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_attempts_are_cut_off() {
        let calls = AtomicU32::new(0);

        let result = Retrier::default()
            .run(&Context::background(), |_sub| {
                let attempt = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if attempt < 2 {
                        std::future::pending::<()>().await;
                    }
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: anyhow::Result<()> = Retrier::default()
            .run(&Context::background(), |_sub| {
                calls.fetch_add(1, Ordering::Relaxed);
                async {
                    Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
                        .context("making HTTP request")
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<io::Error>().map(io::Error::kind),
            Some(io::ErrorKind::ConnectionRefused)
        );
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_umbrella_deadline_ends_retries() {
        let calls = AtomicU32::new(0);
        let ctx = Context::with_timeout(Duration::from_secs(1));

        let result: anyhow::Result<()> = Retrier::default()
            .run(&ctx, |_sub| {
                calls.fetch_add(1, Ordering::Relaxed);
                std::future::pending()
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ContextError>(),
            Some(&ContextError::DeadlineExceeded)
        );
        assert!(err.downcast_ref::<AttemptTimeout>().is_none());
        // 100ms + 150ms + 225ms + 337.5ms, then the fifth attempt is cut to the umbrella deadline.
        assert_eq!(calls.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_umbrella_already_done_after_retryable_failure() {
        let calls = AtomicU32::new(0);
        let ctx = Context::background();
        ctx.cancel();

        let result: anyhow::Result<()> = Retrier::default()
            .run(&ctx, |_sub| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(timed_out()) }
            })
            .await;

        assert_eq!(
            result.unwrap_err().downcast_ref::<ContextError>(),
            Some(&ContextError::Cancelled)
        );
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt() {
        let calls = AtomicU32::new(0);
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(180)).await;
            canceller.cancel();
        });

        let result: anyhow::Result<()> = Retrier::default()
            .run(&ctx, |_sub| {
                calls.fetch_add(1, Ordering::Relaxed);
                std::future::pending()
            })
            .await;

        assert_eq!(
            result.unwrap_err().downcast_ref::<ContextError>(),
            Some(&ContextError::Cancelled)
        );
        // The first attempt times out at 100ms, the second is cancelled at 180ms.
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracer_sees_start_and_finish_only() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let tracer: Arc<dyn Tracer> = Arc::new(move |_ctx: &Context, line: fmt::Arguments<'_>| {
            sink.lock().unwrap().push(line.to_string());
        });
        let calls = AtomicU32::new(0);

        let result = Retrier::default()
            .with_tracer(Some(tracer))
            .run(&Context::background(), |_sub| {
                let attempt = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if attempt < 3 {
                        Err(timed_out())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Nanoleaf operation starting with timeout 100ms");
        assert!(lines[1].starts_with("Nanoleaf operation finished after"));
    }
}
