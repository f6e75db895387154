//! Bounded retries and wait-for-state polling around provider calls

use crate::{
    Error, Result,
    provider::{CloudProvider, InstanceState, ServerRecord, SpotState, Tags, VolumeRecord, VolumeState},
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed attempt budget with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Ordinary provider calls (describe, tag, attach)
    pub const fn standard() -> Self {
        Self::new(5, Duration::from_secs(2))
    }

    /// On-demand launches
    pub const fn launch() -> Self {
        Self::new(5, Duration::from_secs(5))
    }

    /// Spot requests, which are often refused for capacity
    pub const fn spot() -> Self {
        Self::new(10, Duration::from_secs(10))
    }

    /// Same budget, no delay
    pub const fn immediate(self) -> Self {
        Self::new(self.attempts, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Polling interval and cap for wait-for-state loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Delay between probes
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl WaitPolicy {
    /// Create a policy
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Same cap, another interval
    pub const fn with_interval(self, interval: Duration) -> Self {
        Self::new(interval, self.timeout)
    }

    /// Same interval, another cap
    pub const fn with_timeout(self, timeout: Duration) -> Self {
        Self::new(self.interval, timeout)
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(600))
    }
}

/// Provider handle that retries transient failures and polls for states
#[derive(Clone)]
pub struct RetryingProviderClient {
    provider: Arc<dyn CloudProvider>,
    policy: RetryPolicy,
    wait: WaitPolicy,
}

impl RetryingProviderClient {
    /// Wrap a provider with the default policies
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default(),
            wait: WaitPolicy::default(),
        }
    }

    /// Use another default retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use another wait policy
    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// The wrapped provider, for calls that must not be retried
    pub fn provider(&self) -> &dyn CloudProvider {
        self.provider.as_ref()
    }

    /// Default retry policy
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Wait policy
    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }

    /// Run `call` under the default policy
    pub async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry(operation, self.policy, call).await
    }

    /// Run `call` until it succeeds, fails permanently or the budget runs out
    ///
    /// Only transient failures are retried. An exhausted budget becomes
    /// [`Error::RetriesExhausted`] carrying the last failure.
    pub async fn retry<T, F, Fut>(&self, operation: &str, policy: RetryPolicy, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "Attempt {}/{} of '{}' failed: {}. Retrying",
                        attempt, attempts, operation, e
                    );
                    attempt += 1;
                    if !policy.delay.is_zero() {
                        smol::Timer::after(policy.delay).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll `probe` until `done` holds for its result or the cap is hit
    ///
    /// Transient probe failures count as "not yet".
    pub async fn wait_for<T, F, Fut, P>(&self, what: &str, mut probe: F, done: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&T) -> bool,
    {
        let started = Instant::now();
        let mut probes = 0u32;
        loop {
            probes += 1;
            match probe().await {
                Ok(value) if done(&value) => {
                    debug!("{} reached after {} probe(s)", what, probes);
                    return Ok(value);
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => debug!("Probe for {} failed: {}", what, e),
                Err(e) => return Err(e),
            }
            if started.elapsed() >= self.wait.timeout {
                return Err(Error::Timeout {
                    what: what.to_string(),
                    seconds: self.wait.timeout.as_secs(),
                });
            }
            if probes % 12 == 0 {
                info!("Still waiting for {} ({}s)", what, started.elapsed().as_secs());
            }
            if !self.wait.interval.is_zero() {
                smol::Timer::after(self.wait.interval).await;
            }
        }
    }

    /// Same as [`wait_for`](Self::wait_for) with a different cap
    pub async fn wait_for_within<T, F, Fut, P>(
        &self,
        what: &str,
        timeout: Duration,
        probe: F,
        done: P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&T) -> bool,
    {
        let capped = Self {
            provider: self.provider.clone(),
            policy: self.policy,
            wait: self.wait.with_timeout(timeout),
        };
        capped.wait_for(what, probe, done).await
    }

    /// Wait until a server is in `state`
    pub async fn wait_server(&self, id: &str, state: InstanceState) -> Result<ServerRecord> {
        let what = format!("{} to be {}", id, state);
        let server = self
            .wait_for(
                &what,
                move || async move { self.provider.get_server(id).await },
                |s| s.as_ref().is_some_and(|s| s.state == state),
            )
            .await?;
        server.ok_or_else(|| Error::NotFound(format!("server {}", id)))
    }

    /// Wait until a volume is in `state`
    pub async fn wait_volume(&self, id: &str, state: VolumeState) -> Result<VolumeRecord> {
        let what = format!("volume {} to be {:?}", id, state);
        let volume = self
            .wait_for(
                &what,
                move || async move { self.provider.get_volume(id).await },
                |v| v.as_ref().is_some_and(|v| v.state == state),
            )
            .await?;
        volume.ok_or_else(|| Error::NotFound(format!("volume {}", id)))
    }

    /// Wait until a volume is gone
    pub async fn wait_volume_deleted(&self, id: &str) -> Result<()> {
        let what = format!("volume {} to be deleted", id);
        self.wait_for(
            &what,
            move || async move { self.provider.get_volume(id).await },
            |v| v.as_ref().is_none_or(|v| v.state == VolumeState::Deleted),
        )
        .await?;
        Ok(())
    }

    /// Wait until every spot request is fulfilled, returning instance ids
    pub async fn wait_spot_fulfilled(&self, request_ids: &[String]) -> Result<Vec<String>> {
        let requests = self
            .wait_for(
                "spot requests to become active",
                move || async move { self.provider.describe_spot_requests(request_ids).await },
                |requests| {
                    requests.len() == request_ids.len()
                        && requests.iter().all(|r| r.state != SpotState::Open)
                },
            )
            .await?;
        if let Some(failed) = requests.iter().find(|r| r.state != SpotState::Active) {
            return Err(Error::provider(
                "request-spot-instances",
                format!("spot request {} ended as {:?}", failed.id, failed.state),
                false,
            ));
        }
        Ok(requests.into_iter().filter_map(|r| r.instance_id).collect())
    }

    /// Write tags, retrying transient failures
    pub async fn tag(&self, resource_id: &str, tags: &Tags) -> Result<()> {
        self.call("create-tags", move || self.provider.create_tags(resource_id, tags))
            .await?;
        debug!("Tagged {} with {} tag(s)", resource_id, tags.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn client() -> RetryingProviderClient {
        RetryingProviderClient::new(Arc::new(MockProvider::new()))
            .with_policy(RetryPolicy::standard().immediate())
            .with_wait(WaitPolicy::new(Duration::ZERO, Duration::from_millis(50)))
    }

    #[smol_potat::test]
    async fn test_transient_failures_are_retried() {
        let client = client();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let value = client
            .call("describe-volumes", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::provider("describe-volumes", "throttled", true))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[smol_potat::test]
    async fn test_exhausted_budget_is_typed() {
        let client = client();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let err = client
            .retry("request-spot-instances", RetryPolicy::spot().immediate(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::provider("request-spot-instances", "capacity", true))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 10, .. }));
    }

    #[smol_potat::test]
    async fn test_permanent_failures_are_not_retried() {
        let client = client();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let err = client
            .call("create-tags", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::provider("create-tags", "InvalidID", false))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[smol_potat::test]
    async fn test_delay_between_attempts_is_fixed() {
        let client = client();
        let delay = Duration::from_millis(40);
        let started = Instant::now();
        let calls = Mutex::new(Vec::new());
        let calls = &calls;
        client
            .retry("describe-snapshots", RetryPolicy::new(5, delay), move || async move {
                calls.lock().unwrap().push(started.elapsed());
                Err::<(), _>(Error::provider("describe-snapshots", "throttled", true))
            })
            .await
            .unwrap_err();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
        // doubling delays would need 600ms for the same five attempts
        assert!(calls[4] < Duration::from_millis(400), "took {:?}", calls[4]);
    }

    #[smol_potat::test]
    async fn test_wait_for_times_out() {
        let client = client();
        let err = client
            .wait_for("never", || async { Ok(false) }, |done| *done)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
