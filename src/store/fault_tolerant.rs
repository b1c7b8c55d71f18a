use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rocket::futures::FutureExt;
use rocket::tokio::time::{sleep, timeout};
use serde::Deserialize;

use crate::metrics::VotingMetrics;
use crate::model::{Election, Vote};

use super::{
    BreakerConfig, BreakerState, CircuitBreaker, ElectionStore, FallbackCache, StoreAdapter,
    StoreError, StoreRole, SubmitStatus, VoteStore,
};

/// Retry, timeout and circuit breaker settings applied to every store call.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FaultPolicy {
    pub breaker: BreakerConfig,
    /// Attempts made after the first one fails.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Upper bound on a single attempt.
    pub timeout_ms: u64,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            max_retries: 3,
            retry_delay_ms: 500,
            timeout_ms: 5_000,
        }
    }
}

impl FaultPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Defaults for vote saves.
    pub fn for_votes() -> Self {
        Self {
            breaker: BreakerConfig {
                request_volume_threshold: 10,
                failure_ratio: 0.5,
                delay_ms: 10_000,
            },
            max_retries: 3,
            retry_delay_ms: 200,
            timeout_ms: 3_000,
        }
    }
}

/// Circuit breaker, retries and a per-attempt timeout around the calls made
/// to one store.
pub struct FaultGuard {
    name: String,
    policy: FaultPolicy,
    breaker: CircuitBreaker,
    metrics: Arc<VotingMetrics>,
}

impl FaultGuard {
    pub fn new(name: impl Into<String>, policy: FaultPolicy, metrics: Arc<VotingMetrics>) -> Self {
        Self {
            name: name.into(),
            breaker: CircuitBreaker::new(policy.breaker),
            policy,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run `op` under the breaker, retrying failed attempts while the breaker
    /// allows it. A panicking attempt counts as a failure.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        target: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut retries = 0;
        loop {
            let Some(permit) = self.breaker.try_acquire() else {
                debug!(
                    "Circuit breaker for {} store is open, skipping {operation} of {target}",
                    self.name
                );
                return Err(StoreError::CircuitOpen);
            };

            let outcome = match AssertUnwindSafe(timeout(self.policy.timeout(), op()))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(StoreError::Timeout(self.policy.timeout())),
                Err(_) => {
                    error!("{operation} of {target} on {} store panicked", self.name);
                    Err(StoreError::Panicked)
                }
            };

            match outcome {
                Ok(value) => {
                    permit.succeed();
                    return Ok(value);
                }
                Err(err) => {
                    if permit.fail() {
                        self.metrics.circuit_breaker_trips.inc();
                        warn!("Circuit breaker for {} store opened", self.name);
                    }
                    if retries >= self.policy.max_retries {
                        return Err(err);
                    }
                    retries += 1;
                    debug!(
                        "Retrying {operation} of {target} on {} store ({retries}/{}): {err}",
                        self.name, self.policy.max_retries
                    );
                    sleep(self.policy.retry_delay()).await;
                }
            }
        }
    }
}

/// Wraps an [`ElectionStore`] with a [`FaultGuard`] and a fallback cache,
/// turning it into a [`StoreAdapter`].
pub struct FaultTolerant<S> {
    role: StoreRole,
    store: S,
    guard: FaultGuard,
    cache: Arc<FallbackCache>,
}

impl<S> FaultTolerant<S>
where
    S: ElectionStore,
{
    pub fn new(
        name: impl Into<String>,
        role: StoreRole,
        store: S,
        policy: FaultPolicy,
        cache: Arc<FallbackCache>,
        metrics: Arc<VotingMetrics>,
    ) -> Self {
        Self {
            role,
            store,
            guard: FaultGuard::new(name, policy, metrics),
            cache,
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &FallbackCache {
        &self.cache
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        election_id: &str,
        op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        self.guard
            .call(operation, &format!("election {election_id}"), op)
            .await
    }
}

#[rocket::async_trait]
impl<S> StoreAdapter for FaultTolerant<S>
where
    S: ElectionStore,
{
    fn name(&self) -> &str {
        self.guard.name()
    }

    fn role(&self) -> StoreRole {
        self.role
    }

    fn breaker_state(&self) -> BreakerState {
        self.guard.breaker_state()
    }

    async fn submit(&self, election: &Election) -> SubmitStatus {
        match self
            .call("submit", &election.id, || self.store.submit(election))
            .await
        {
            Ok(()) => {
                self.cache.put(election.clone());
                info!(
                    "Election {} submitted successfully to {} store",
                    election.id, self.guard.name()
                );
                SubmitStatus::Ok
            }
            Err(err) => {
                warn!(
                    "Using fallback for election {} submission, {} store unavailable: {err}",
                    election.id, self.guard.name()
                );
                self.cache.put(election.clone());
                SubmitStatus::Cached
            }
        }
    }

    async fn sync(&self, election: &Election) -> Election {
        match self
            .call("sync", &election.id, || self.store.sync(election))
            .await
        {
            Ok(synced) => {
                self.cache.put(synced.clone());
                info!(
                    "Election {} synced successfully from {} store",
                    election.id, self.guard.name()
                );
                synced
            }
            Err(err) => {
                warn!(
                    "Using fallback for election {} sync, {} store unavailable: {err}",
                    election.id, self.guard.name()
                );
                match self.cache.get(&election.id) {
                    Some(cached) => {
                        info!("Returning cached election {}", election.id);
                        cached
                    }
                    None => {
                        warn!(
                            "No cached data for election {}, returning original",
                            election.id
                        );
                        election.clone()
                    }
                }
            }
        }
    }
}

/// Wraps a [`VoteStore`] so that saves go through a [`FaultGuard`]. Counts
/// are read straight from the store.
pub struct FaultTolerantVotes {
    store: Arc<dyn VoteStore>,
    guard: FaultGuard,
}

impl FaultTolerantVotes {
    pub fn new(
        store: Arc<dyn VoteStore>,
        policy: FaultPolicy,
        metrics: Arc<VotingMetrics>,
    ) -> Self {
        Self {
            store,
            guard: FaultGuard::new("vote", policy, metrics),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.guard.breaker_state()
    }
}

#[rocket::async_trait]
impl VoteStore for FaultTolerantVotes {
    /// Unlike the election adapters there is no fallback copy to serve: a
    /// vote that cannot be saved is reported as failed.
    async fn save(&self, vote: &Vote) -> Result<(), StoreError> {
        let target = format!("vote {}", vote.key());
        self.guard
            .call("save", &target, || self.store.save(vote))
            .await
            .map_err(|err| {
                warn!(
                    "Vote store unavailable, vote not saved: voter={}, candidate={}: {err}",
                    vote.voter_id(),
                    vote.candidate_id()
                );
                err
            })
    }

    async fn count_by_candidate(
        &self,
        election_id: &str,
        candidate_id: &str,
    ) -> Result<u64, StoreError> {
        self.store.count_by_candidate(election_id, candidate_id).await
    }

    async fn count_by_election(&self, election_id: &str) -> Result<u64, StoreError> {
        self.store.count_by_election(election_id).await
    }
}
