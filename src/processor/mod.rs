use std::fmt::{Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rocket::futures::FutureExt;
use rocket::tokio::{
    self,
    sync::{mpsc, Mutex},
    task::JoinSet,
    time::{sleep, timeout},
};
use rocket::FromFormField;
use serde::{Deserialize, Serialize};

use crate::metrics::VotingMetrics;
use crate::model::{BatchStatus, BatchVoteResult, Vote, VoteResult};
use crate::store::{StoreError, VoteStore};

pub use shutdown::Shutdown;

mod shutdown;

/// Largest batch that [`Strategy::Auto`] processes sequentially.
pub const SEQUENTIAL_MAX_VOTES: usize = 10;
/// Largest batch that [`Strategy::Auto`] hands to the bounded pool.
pub const BOUNDED_POOL_MAX_VOTES: usize = 100;

/// How a batch of votes is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromFormField)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One vote at a time on the calling task.
    #[field(value = "sequential")]
    Sequential,
    /// A fixed pool of workers fed through a bounded queue.
    #[field(value = "bounded_pool")]
    BoundedPool,
    /// One spawned task per vote.
    #[field(value = "lightweight_tasks")]
    LightweightTasks,
    /// Pick one of the above by batch size.
    #[default]
    #[field(value = "auto")]
    Auto,
}

impl Strategy {
    /// The concrete strategy used for a batch of the given size.
    pub fn resolve(self, batch_size: usize) -> Strategy {
        match self {
            Self::Auto if batch_size <= SEQUENTIAL_MAX_VOTES => Self::Sequential,
            Self::Auto if batch_size <= BOUNDED_POOL_MAX_VOTES => Self::BoundedPool,
            Self::Auto => Self::LightweightTasks,
            concrete => concrete,
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sequential => "sequential",
            Self::BoundedPool => "bounded pool",
            Self::LightweightTasks => "lightweight tasks",
            Self::Auto => "auto",
        };
        write!(f, "{name}")
    }
}

/// Batch processing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Workers in the bounded pool.
    pub pool_size: usize,
    /// How long in-flight votes may run after shutdown is requested.
    pub grace_period_ms: u64,
    /// Upper bound on processing a single vote.
    pub vote_timeout_ms: u64,
    /// Fixed per-vote latency, standing in for the store round trip.
    pub vote_latency_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            grace_period_ms: 60_000,
            vote_timeout_ms: 3_000,
            vote_latency_ms: 10,
        }
    }
}

impl ProcessorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Everything needed to apply one vote, cheap to clone into tasks.
#[derive(Clone)]
struct VoteWorker {
    store: Arc<dyn VoteStore>,
    metrics: Arc<VotingMetrics>,
    timeout: Duration,
    latency: Duration,
}

impl VoteWorker {
    /// Persist one vote. Never fails: every error, including a panic in the
    /// store, becomes a failed result.
    async fn apply(&self, vote: Vote) -> VoteResult {
        let start = Instant::now();
        let vote_id = vote.key();

        let work = async {
            self.store.save(&vote).await?;
            sleep(self.latency).await;
            Ok::<(), StoreError>(())
        };
        let outcome = AssertUnwindSafe(timeout(self.timeout, work))
            .catch_unwind()
            .await;

        let elapsed = start.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.metrics.votes_total.inc();
        self.metrics.observe_vote(elapsed);

        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(err))) => Some(err.to_string()),
            Ok(Err(_)) => Some(format!(
                "Vote processing timed out after {}ms",
                self.timeout.as_millis()
            )),
            Err(_) => Some("Vote processing panicked".to_string()),
        };

        match failure {
            None => {
                self.metrics.votes_success.inc();
                debug!(
                    "Vote saved: voter={}, candidate={}, election={}",
                    vote.voter_id(),
                    vote.candidate_id(),
                    vote.election_id()
                );
                VoteResult::success(vote_id, elapsed_ms)
            }
            Some(message) => {
                self.metrics.votes_failed.inc();
                error!(
                    "Failed to process vote for candidate {}: {message}",
                    vote.candidate_id()
                );
                VoteResult::failure(vote_id, message, elapsed_ms)
            }
        }
    }
}

/// Applies batches of votes with a selectable concurrency strategy.
///
/// Every vote handed in yields exactly one [`VoteResult`], unless the batch
/// is cut short by [`VoteProcessor::shutdown`] and in-flight votes outlive
/// the grace period.
pub struct VoteProcessor {
    worker: VoteWorker,
    config: ProcessorConfig,
    shutdown: Arc<Shutdown>,
}

impl VoteProcessor {
    pub fn new(
        store: Arc<dyn VoteStore>,
        config: ProcessorConfig,
        metrics: Arc<VotingMetrics>,
    ) -> Self {
        let worker = VoteWorker {
            store,
            metrics,
            timeout: Duration::from_millis(config.vote_timeout_ms),
            latency: Duration::from_millis(config.vote_latency_ms),
        };
        Self {
            worker,
            config,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// Stop accepting work. Running batches get the grace period to finish
    /// their in-flight votes before the rest is abandoned.
    pub fn shutdown(&self) {
        info!("Vote processor shutting down");
        self.shutdown.trigger();
    }

    /// Process a single vote.
    pub async fn submit_vote(&self, vote: Vote) -> VoteResult {
        self.worker.apply(vote).await
    }

    /// Process a batch of votes with the given strategy.
    pub async fn process(&self, votes: Vec<Vote>, strategy: Strategy) -> BatchVoteResult {
        let submitted = votes.len();
        let strategy = strategy.resolve(submitted);
        info!("Processing {submitted} votes with {strategy} strategy");

        let start = Instant::now();
        let results = match strategy {
            Strategy::Sequential => self.run_sequential(votes).await,
            Strategy::BoundedPool => self.run_bounded_pool(votes).await,
            Strategy::LightweightTasks | Strategy::Auto => self.run_tasks(votes).await,
        };
        let elapsed = start.elapsed();
        self.worker.metrics.observe_batch(elapsed);

        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let batch = BatchVoteResult::from_results(results, submitted, elapsed_ms);
        if let BatchStatus::Unresolved { missing } = batch.status {
            warn!("Batch unresolved: {missing} of {submitted} votes have no result and must be reconciled");
        }
        info!("{strategy} processing completed in {elapsed_ms}ms");
        batch
    }

    async fn run_sequential(&self, votes: Vec<Vote>) -> Vec<VoteResult> {
        let mut results = Vec::with_capacity(votes.len());
        for vote in votes {
            if self.shutdown.is_triggered() {
                break;
            }
            results.push(self.worker.apply(vote).await);
        }
        results
    }

    async fn run_bounded_pool(&self, votes: Vec<Vote>) -> Vec<VoteResult> {
        let expected = votes.len();
        let pool_size = self.config.pool_size.max(1);
        debug!("Starting pool of {pool_size} vote workers");

        let (job_tx, job_rx) = mpsc::channel::<Vote>(pool_size);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for _ in 0..pool_size {
            let worker = self.worker.clone();
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            tasks.spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    match next {
                        Some(vote) => {
                            let _ = result_tx.send(worker.apply(vote).await);
                        }
                        None => break,
                    }
                }
            });
        }
        drop(result_tx);

        // Feed the queue; this waits whenever every worker is busy.
        let shutdown = self.shutdown.clone();
        tasks.spawn(async move {
            for vote in votes {
                if shutdown.is_triggered() || job_tx.send(vote).await.is_err() {
                    break;
                }
            }
        });

        self.collect(result_rx, tasks, expected).await
    }

    async fn run_tasks(&self, votes: Vec<Vote>) -> Vec<VoteResult> {
        let expected = votes.len();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for vote in votes {
            let worker = self.worker.clone();
            let result_tx = result_tx.clone();
            tasks.spawn(async move {
                let _ = result_tx.send(worker.apply(vote).await);
            });
        }
        drop(result_tx);

        self.collect(result_rx, tasks, expected).await
    }

    /// Gather results until every task is done, or until shutdown plus the
    /// grace period, after which the remaining tasks are aborted.
    async fn collect(
        &self,
        mut results: mpsc::UnboundedReceiver<VoteResult>,
        mut tasks: JoinSet<()>,
        expected: usize,
    ) -> Vec<VoteResult> {
        let mut collected = Vec::with_capacity(expected);

        let interrupted = loop {
            tokio::select! {
                next = results.recv() => match next {
                    Some(result) => collected.push(result),
                    None => break false,
                },
                _ = self.shutdown.wait() => break true,
            }
        };

        if interrupted {
            let grace = self.config.grace_period();
            warn!(
                "Shutdown requested with {} of {expected} votes processed, waiting up to {grace:?} for in-flight votes",
                collected.len()
            );
            let drain = async {
                while let Some(result) = results.recv().await {
                    collected.push(result);
                }
            };
            if timeout(grace, drain).await.is_err() {
                warn!("Grace period expired, aborting outstanding vote workers");
                tasks.abort_all();
            }
        }

        while tasks.join_next().await.is_some() {}
        collected
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::store::MemoryVoteStore;

    /// Fails votes from voters named `bad*`, panics on `boom*`, and stalls on
    /// `slow*`.
    struct PickyStore {
        inner: MemoryVoteStore,
    }

    #[rocket::async_trait]
    impl VoteStore for PickyStore {
        async fn save(&self, vote: &Vote) -> Result<(), StoreError> {
            if vote.voter_id().starts_with("bad") {
                return Err(StoreError::Unavailable("rejected".to_string()));
            }
            if vote.voter_id().starts_with("boom") {
                panic!("store exploded");
            }
            if vote.voter_id().starts_with("slow") {
                sleep(Duration::from_millis(500)).await;
            }
            self.inner.save(vote).await
        }

        async fn count_by_candidate(
            &self,
            election_id: &str,
            candidate_id: &str,
        ) -> Result<u64, StoreError> {
            self.inner.count_by_candidate(election_id, candidate_id).await
        }

        async fn count_by_election(&self, election_id: &str) -> Result<u64, StoreError> {
            self.inner.count_by_election(election_id).await
        }
    }

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            pool_size: 4,
            grace_period_ms: 1_000,
            vote_timeout_ms: 100,
            vote_latency_ms: 5,
        }
    }

    fn processor(config: ProcessorConfig) -> (VoteProcessor, Arc<MemoryVoteStore>) {
        let store = Arc::new(MemoryVoteStore::new());
        let processor = VoteProcessor::new(store.clone(), config, Arc::new(VotingMetrics::default()));
        (processor, store)
    }

    fn picky_processor() -> VoteProcessor {
        let store = Arc::new(PickyStore {
            inner: MemoryVoteStore::new(),
        });
        VoteProcessor::new(store, config(), Arc::new(VotingMetrics::default()))
    }

    fn votes(n: usize) -> Vec<Vote> {
        (0..n)
            .map(|i| Vote::new("e1", format!("c{}", i % 3), format!("v{i}")).unwrap())
            .collect()
    }

    fn outcomes(batch: &BatchVoteResult) -> BTreeSet<(String, bool)> {
        batch
            .results
            .iter()
            .map(|r| (r.vote_id.clone(), r.success))
            .collect()
    }

    #[test]
    fn auto_strategy_thresholds() {
        assert_eq!(Strategy::Auto.resolve(1), Strategy::Sequential);
        assert_eq!(Strategy::Auto.resolve(10), Strategy::Sequential);
        assert_eq!(Strategy::Auto.resolve(11), Strategy::BoundedPool);
        assert_eq!(Strategy::Auto.resolve(100), Strategy::BoundedPool);
        assert_eq!(Strategy::Auto.resolve(101), Strategy::LightweightTasks);
        assert_eq!(Strategy::BoundedPool.resolve(1), Strategy::BoundedPool);
    }

    #[rocket::async_test]
    async fn sequential_scenario() {
        let (processor, store) = processor(config());
        let votes = vec![
            Vote::new("e1", "c1", "v1").unwrap(),
            Vote::new("e1", "c2", "v2").unwrap(),
            Vote::new("e1", "c1", "v3").unwrap(),
        ];

        let batch = processor.process(votes, Strategy::Sequential).await;
        assert_eq!(batch.total_votes, 3);
        assert_eq!(batch.success_count, 3);
        assert_eq!(batch.failure_count, 0);
        assert!(batch.is_complete());

        // Sequential keeps input order.
        let ids: Vec<_> = batch.results.iter().map(|r| r.vote_id.as_str()).collect();
        assert_eq!(ids, vec!["e1:v1", "e1:v2", "e1:v3"]);

        assert_eq!(store.count_by_candidate("e1", "c1").await.unwrap(), 2);
        assert_eq!(store.count_by_candidate("e1", "c2").await.unwrap(), 1);
    }

    #[rocket::async_test]
    async fn every_strategy_yields_one_result_per_vote() {
        for strategy in [
            Strategy::Sequential,
            Strategy::BoundedPool,
            Strategy::LightweightTasks,
            Strategy::Auto,
        ] {
            for n in [1, 7, 40, 150] {
                let (processor, store) = processor(config());
                let batch = processor.process(votes(n), strategy).await;
                assert_eq!(batch.total_votes, n, "{strategy} with {n} votes");
                assert_eq!(batch.success_count + batch.failure_count, batch.total_votes);
                assert_eq!(batch.success_count, n);
                assert_eq!(outcomes(&batch).len(), n);
                assert_eq!(store.len(), n);
            }
        }
    }

    #[rocket::async_test]
    async fn failures_are_isolated() {
        let mut votes = votes(20);
        votes.push(Vote::new("e1", "c1", "bad-1").unwrap());
        votes.push(Vote::new("e1", "c1", "boom-1").unwrap());
        votes.push(Vote::new("e1", "c1", "slow-1").unwrap());

        for strategy in [Strategy::Sequential, Strategy::BoundedPool, Strategy::LightweightTasks] {
            let batch = picky_processor().process(votes.clone(), strategy).await;
            assert_eq!(batch.total_votes, 23, "{strategy}");
            assert_eq!(batch.success_count, 20, "{strategy}");
            assert_eq!(batch.failure_count, 3, "{strategy}");

            let failed: BTreeSet<_> = batch
                .results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.vote_id.as_str())
                .collect();
            assert_eq!(
                failed,
                BTreeSet::from(["e1:bad-1", "e1:boom-1", "e1:slow-1"])
            );

            let slow = batch
                .results
                .iter()
                .find(|r| r.vote_id == "e1:slow-1")
                .unwrap();
            assert!(slow.error_message.as_deref().unwrap().contains("timed out"));
        }
    }

    #[rocket::async_test]
    async fn auto_matches_sequential_for_small_batches() {
        let mut votes = votes(6);
        votes.push(Vote::new("e1", "c1", "bad-2").unwrap());
        votes.push(Vote::new("e1", "c2", "bad-3").unwrap());

        let sequential = picky_processor().process(votes.clone(), Strategy::Sequential).await;
        let auto = picky_processor().process(votes, Strategy::Auto).await;
        assert_eq!(outcomes(&sequential), outcomes(&auto));
        assert_eq!(sequential.success_count, auto.success_count);
        assert_eq!(sequential.failure_count, auto.failure_count);
    }

    #[rocket::async_test]
    async fn bounded_pool_runs_concurrently() {
        let (processor, _) = processor(ProcessorConfig {
            pool_size: 10,
            vote_latency_ms: 20,
            ..config()
        });
        let batch = processor.process(votes(50), Strategy::BoundedPool).await;
        assert_eq!(batch.success_count, 50);
        // Sequential would need at least 50 * 20ms.
        assert!(batch.total_processing_time_ms < 1_000);
    }

    #[rocket::async_test]
    async fn shutdown_within_grace_period_completes_batch() {
        let (processor, _) = processor(ProcessorConfig {
            vote_latency_ms: 50,
            grace_period_ms: 2_000,
            vote_timeout_ms: 1_000,
            ..config()
        });
        let processor = Arc::new(processor);

        let running = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process(votes(30), Strategy::LightweightTasks).await })
        };
        sleep(Duration::from_millis(10)).await;
        processor.shutdown();

        let batch = running.await.unwrap();
        assert_eq!(batch.total_votes, 30);
        assert!(batch.is_complete());
    }

    #[rocket::async_test]
    async fn grace_period_expiry_leaves_batch_unresolved() {
        let (processor, _) = processor(ProcessorConfig {
            vote_latency_ms: 500,
            grace_period_ms: 20,
            vote_timeout_ms: 1_000,
            ..config()
        });
        let processor = Arc::new(processor);

        let running = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process(votes(30), Strategy::LightweightTasks).await })
        };
        sleep(Duration::from_millis(10)).await;
        processor.shutdown();

        let batch = running.await.unwrap();
        assert_eq!(batch.submitted_votes, 30);
        assert_eq!(batch.total_votes, 0);
        assert_eq!(batch.status, BatchStatus::Unresolved { missing: 30 });
    }

    #[rocket::async_test]
    async fn single_vote_submission() {
        let (processor, store) = processor(config());
        let result = processor
            .submit_vote(Vote::new("e1", "c1", "v1").unwrap())
            .await;
        assert!(result.success);
        assert_eq!(result.vote_id, "e1:v1");
        assert_eq!(store.len(), 1);
    }

    /// Fails the first save it receives, then behaves normally.
    struct FlakyStore {
        inner: MemoryVoteStore,
        failed: std::sync::atomic::AtomicBool,
    }

    #[rocket::async_trait]
    impl VoteStore for FlakyStore {
        async fn save(&self, vote: &Vote) -> Result<(), StoreError> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.save(vote).await
        }

        async fn count_by_candidate(
            &self,
            election_id: &str,
            candidate_id: &str,
        ) -> Result<u64, StoreError> {
            self.inner.count_by_candidate(election_id, candidate_id).await
        }

        async fn count_by_election(&self, election_id: &str) -> Result<u64, StoreError> {
            self.inner.count_by_election(election_id).await
        }
    }

    #[rocket::async_test]
    async fn transient_store_error_is_retried() {
        use crate::store::{testing::fast_policy, BreakerState, FaultTolerantVotes};

        let flaky = Arc::new(FlakyStore {
            inner: MemoryVoteStore::new(),
            failed: Default::default(),
        });
        let metrics = Arc::new(VotingMetrics::default());
        let store = Arc::new(FaultTolerantVotes::new(flaky.clone(), fast_policy(), metrics.clone()));
        let processor = VoteProcessor::new(store.clone(), config(), metrics.clone());

        let result = processor
            .submit_vote(Vote::new("e1", "c1", "v1").unwrap())
            .await;
        assert!(result.success);
        assert_eq!(flaky.inner.len(), 1);
        assert_eq!(store.breaker_state(), BreakerState::Closed);
        assert_eq!(metrics.votes_success.get(), 1);
        assert_eq!(metrics.votes_failed.get(), 0);
    }
}
