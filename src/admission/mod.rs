use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::metrics::VotingMetrics;

pub use bucket::RateBucket;

mod bucket;

/// A category of operation with its own throttling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    /// Casting votes; the anti-fraud limit.
    Voting,
    /// Read-only queries.
    Query,
    /// Administrative operations such as submitting elections.
    Admin,
}

impl Display for TrafficClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Voting => "voting",
            Self::Query => "query",
            Self::Admin => "admin",
        };
        write!(f, "{name}")
    }
}

/// Bucket capacity and the period over which that many tokens are refilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RatePolicy {
    pub capacity: u32,
    pub period_ms: u64,
}

impl RatePolicy {
    pub const fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            period_ms: 60_000,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Admission configuration, one policy per traffic class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub voting: RatePolicy,
    pub query: RatePolicy,
    pub admin: RatePolicy,
    /// Buckets that have been full for this long are evicted.
    pub idle_ttl_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            voting: RatePolicy::per_minute(10),
            query: RatePolicy::per_minute(100),
            admin: RatePolicy::per_minute(50),
            idle_ttl_secs: 600,
        }
    }
}

impl AdmissionConfig {
    pub fn policy(&self, class: TrafficClass) -> RatePolicy {
        match class {
            TrafficClass::Voting => self.voting,
            TrafficClass::Query => self.query,
            TrafficClass::Admin => self.admin,
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Whole seconds until a retry can succeed; zero when allowed.
    pub retry_after_secs: u64,
}

impl Decision {
    const ALLOWED: Decision = Decision {
        allowed: true,
        retry_after_secs: 0,
    };

    fn rejected(wait: Duration) -> Self {
        // Round up so a rejection never tells the caller to retry immediately.
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        Self {
            allowed: false,
            retry_after_secs: secs.max(1),
        }
    }
}

/// Number of live buckets per traffic class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub voting_buckets: usize,
    pub query_buckets: usize,
    pub admin_buckets: usize,
}

impl AdmissionStats {
    pub fn total(&self) -> usize {
        self.voting_buckets + self.query_buckets + self.admin_buckets
    }
}

type BucketKey = (TrafficClass, String);

/// Per-identity token bucket rate limiter.
///
/// Buckets are created on first sight of a `(class, identity)` pair and kept
/// in this controller's registry until evicted by [`Self::evict_idle`].
/// Admission never blocks: the bucket itself is a single atomic, and the
/// registry lock is only held to look up or insert a bucket.
pub struct AdmissionController {
    config: AdmissionConfig,
    epoch: Instant,
    buckets: RwLock<HashMap<BucketKey, Arc<RateBucket>>>,
    metrics: Arc<VotingMetrics>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, metrics: Arc<VotingMetrics>) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            buckets: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Try to admit one operation of the given class for the given identity.
    pub fn try_admit(&self, class: TrafficClass, identity: &str) -> Decision {
        self.try_admit_at(class, identity, Instant::now())
    }

    fn try_admit_at(&self, class: TrafficClass, identity: &str, now: Instant) -> Decision {
        let bucket = self.bucket(class, identity);
        match bucket.try_acquire(self.nanos_since_epoch(now)) {
            Ok(()) => {
                debug!(
                    "Admitted {class} request for {identity}, {} tokens remaining",
                    bucket.available_tokens(self.nanos_since_epoch(now))
                );
                Decision::ALLOWED
            }
            Err(wait) => {
                self.metrics.rate_limit_hits.inc();
                let decision = Decision::rejected(wait);
                warn!(
                    "Rate limit exceeded for {class} request from {identity}, retry in {}s",
                    decision.retry_after_secs
                );
                decision
            }
        }
    }

    /// Tokens currently available to the given identity, if it has a bucket.
    pub fn available_tokens(&self, class: TrafficClass, identity: &str) -> Option<u32> {
        let now = self.nanos_since_epoch(Instant::now());
        self.read_buckets()
            .get(&(class, identity.to_string()))
            .map(|bucket| bucket.available_tokens(now))
    }

    /// Drop every bucket that has been full for at least the idle TTL.
    /// Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let now = self.nanos_since_epoch(now);
        let ttl = self.config.idle_ttl();
        let mut buckets = self.write_buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.idle_for(now, ttl));
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!("Evicted {evicted} idle rate limit buckets");
        }
        evicted
    }

    /// Remove all buckets.
    pub fn clear(&self) {
        self.write_buckets().clear();
        info!("All rate limit buckets cleared");
    }

    pub fn stats(&self) -> AdmissionStats {
        let mut stats = AdmissionStats::default();
        for (class, _) in self.read_buckets().keys() {
            match class {
                TrafficClass::Voting => stats.voting_buckets += 1,
                TrafficClass::Query => stats.query_buckets += 1,
                TrafficClass::Admin => stats.admin_buckets += 1,
            }
        }
        stats
    }

    /// Get the bucket for the given key, creating it if needed.
    fn bucket(&self, class: TrafficClass, identity: &str) -> Arc<RateBucket> {
        let key = (class, identity.to_string());
        if let Some(bucket) = self.read_buckets().get(&key) {
            return bucket.clone();
        }
        self.write_buckets()
            .entry(key)
            .or_insert_with(|| {
                let policy = self.config.policy(class);
                debug!(
                    "Created {class} rate limit bucket: {} per {}ms",
                    policy.capacity, policy.period_ms
                );
                Arc::new(RateBucket::new(policy.capacity, policy.period()))
            })
            .clone()
    }

    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    // A panic while holding the lock cannot leave a bucket half-updated, so
    // poisoning is ignored.
    fn read_buckets(&self) -> std::sync::RwLockReadGuard<'_, HashMap<BucketKey, Arc<RateBucket>>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_buckets(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<BucketKey, Arc<RateBucket>>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }
}
