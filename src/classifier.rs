//! Failure classification and retry.
//!
//! Every oracle failure already carries an [`ErrorKind`]; this module decides
//! what may be retried and wraps any [`RecognitionClient`] in a retrying
//! decorator.

use async_trait::async_trait;
use facegate_oracle::{
    CallContext, ErrorKind, ImagePayload, OracleFailure, RecognitionClient, RecognitionOutcome,
    RequestMode, ResidentId,
};
use log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

pub fn is_retryable(kind: ErrorKind) -> bool {
    match kind {
        ErrorKind::Transport
        | ErrorKind::Timeout
        | ErrorKind::ServerFault
        | ErrorKind::OracleUnavailable => true,
        ErrorKind::ClientFault | ErrorKind::ProtocolMismatch | ErrorKind::Canceled => false,
    }
}

/// Whether another attempt of a `mode` call may follow `failure`.
///
/// Reads retry on any retryable kind. Side-effecting calls retry only when
/// the failed attempt provably never reached the oracle.
pub fn may_retry(mode: RequestMode, failure: &OracleFailure) -> bool {
    if !is_retryable(failure.kind) {
        return false;
    }
    if mode.is_idempotent() {
        return true;
    }
    !failure.sent && matches!(failure.kind, ErrorKind::Transport | ErrorKind::Timeout)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Exponential delay before retry number `retry` (0-based), capped at
    /// `max_delay`, plus up to half of it again as jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 2;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Sleep for `delay` unless the caller cancels or its deadline passes first,
/// in which case that becomes the call's failure.
async fn pause(delay: Duration, ctx: &CallContext) -> Option<OracleFailure> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Some(OracleFailure::unsent(
            ErrorKind::Canceled,
            "call canceled during retry backoff",
        )),
        _ = ctx.deadline_passed() => Some(OracleFailure::unsent(
            ErrorKind::Timeout,
            "deadline passed during retry backoff",
        )),
        _ = tokio::time::sleep(delay) => None,
    }
}

/// Retries transient failures of the wrapped client according to
/// [`RetryPolicy`] and [`may_retry`].
pub struct Retrying<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: RecognitionClient> Retrying<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn run<F, Fut>(&self, mode: RequestMode, ctx: &CallContext, mut call: F) -> RecognitionOutcome
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RecognitionOutcome> + Send,
    {
        let mut retry = 0;
        loop {
            let outcome = call().await;
            let failure = match &outcome {
                RecognitionOutcome::Failed(failure) => failure,
                _ => return outcome,
            };
            if !may_retry(mode, failure) {
                debug!("{mode} failure not retried: {failure}");
                return outcome;
            }
            if retry >= self.policy.retries {
                warn!("{mode} giving up after {} attempts: {failure}", retry + 1);
                return outcome;
            }

            let delay = self.policy.backoff(retry);
            warn!(
                "{mode} attempt {} failed ({failure}), retrying in {delay:?}",
                retry + 1
            );
            if let Some(abort) = pause(delay, ctx).await {
                return RecognitionOutcome::Failed(abort);
            }
            retry += 1;
        }
    }
}

#[async_trait]
impl<C: RecognitionClient> RecognitionClient for Retrying<C> {
    async fn register(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome {
        self.run(RequestMode::Register, ctx, || {
            self.inner.register(resident_id, image, ctx)
        })
        .await
    }

    async fn verify(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome {
        self.run(RequestMode::Verify, ctx, || {
            self.inner.verify(resident_id, image, ctx)
        })
        .await
    }

    async fn identify(&self, image: &ImagePayload, ctx: &CallContext) -> RecognitionOutcome {
        self.run(RequestMode::Identify, ctx, || self.inner.identify(image, ctx))
            .await
    }

    /// An unhealthy probe counts as [`ErrorKind::OracleUnavailable`] and is
    /// retried with backoff.
    async fn health_check(&self, ctx: &CallContext) -> bool {
        let mut retry = 0;
        loop {
            if self.inner.health_check(ctx).await {
                return true;
            }
            let failure =
                OracleFailure::new(ErrorKind::OracleUnavailable, "health check failed", true);
            if retry >= self.policy.retries || !may_retry(RequestMode::HealthCheck, &failure) {
                warn!("oracle unavailable after {} probes", retry + 1);
                return false;
            }
            if pause(self.policy.backoff(retry), ctx).await.is_some() {
                return false;
            }
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: ErrorKind, sent: bool) -> OracleFailure {
        OracleFailure::new(kind, "boom", sent)
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(is_retryable(ErrorKind::Transport));
        assert!(is_retryable(ErrorKind::Timeout));
        assert!(is_retryable(ErrorKind::ServerFault));
        assert!(is_retryable(ErrorKind::OracleUnavailable));
        assert!(!is_retryable(ErrorKind::ClientFault));
        assert!(!is_retryable(ErrorKind::ProtocolMismatch));
        assert!(!is_retryable(ErrorKind::Canceled));
    }

    #[test]
    fn test_reads_retry_any_transient_failure() {
        assert!(may_retry(RequestMode::Identify, &failure(ErrorKind::ServerFault, true)));
        assert!(may_retry(RequestMode::Identify, &failure(ErrorKind::Timeout, true)));
        assert!(!may_retry(RequestMode::Identify, &failure(ErrorKind::ClientFault, false)));
    }

    #[test]
    fn test_side_effecting_calls_need_proof_of_no_delivery() {
        for mode in [RequestMode::Register, RequestMode::Verify] {
            assert!(may_retry(mode, &failure(ErrorKind::Transport, false)));
            assert!(may_retry(mode, &failure(ErrorKind::Timeout, false)));
            assert!(!may_retry(mode, &failure(ErrorKind::Timeout, true)));
            assert!(!may_retry(mode, &failure(ErrorKind::Transport, true)));
            assert!(!may_retry(mode, &failure(ErrorKind::ServerFault, true)));
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_half_delay() {
        let policy = RetryPolicy {
            retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..100 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));
        }
    }
}
