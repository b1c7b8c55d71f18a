use std::sync::Arc;

use log::{debug, info};
use mongodb::{Client, Database};
use rocket::tokio::task::JoinHandle;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::metrics::VotingMetrics;
use crate::model::Candidate;
use crate::notify::{ElectionSubscriber, MemoryBus, NotificationBus};
use crate::processor::VoteProcessor;
use crate::replicator::ElectionReplicator;
use crate::scheduled_task::PeriodicTask;
use crate::store::{
    CandidateSource, ElectionQuery, ElectionStore, FallbackCache, FaultTolerant,
    FaultTolerantVotes, MemoryCandidateStore, MemoryDurableStore, MemoryRankedStore, MemoryVoteStore,
    MongoCandidateStore, MongoElectionStore, MongoVoteStore, StoreAdapter, StoreRole, VoteStore,
};

/// Every component of the voting backend, wired together. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub admission: Arc<AdmissionController>,
    pub processor: Arc<VoteProcessor>,
    pub replicator: Arc<ElectionReplicator>,
    pub subscriber: Arc<ElectionSubscriber>,
    pub bus: Arc<dyn NotificationBus>,
    pub metrics: Arc<VotingMetrics>,
}

impl Pipeline {
    /// A pipeline whose stores all live in memory.
    pub fn in_memory(config: &Config, candidates: impl IntoIterator<Item = Candidate>) -> Self {
        Self::assemble(
            config,
            Arc::new(MemoryCandidateStore::new(candidates)),
            Arc::new(MemoryVoteStore::new()),
            Arc::new(MemoryDurableStore::new()),
        )
    }

    /// A pipeline persisting votes and elections to MongoDB. The ranked
    /// store stays in memory.
    pub fn mongo(config: &Config, client: Client, db: &Database) -> Self {
        Self::assemble(
            config,
            Arc::new(MongoCandidateStore::new(db)),
            Arc::new(MongoVoteStore::new(db)),
            Arc::new(MongoElectionStore::new(client, db)),
        )
    }

    fn assemble<S>(
        config: &Config,
        candidates: Arc<dyn CandidateSource>,
        votes: Arc<dyn VoteStore>,
        durable: Arc<S>,
    ) -> Self
    where
        S: ElectionStore + ElectionQuery + 'static,
    {
        let metrics = Arc::new(VotingMetrics::new());

        let durable_adapter: Arc<dyn StoreAdapter> = Arc::new(FaultTolerant::new(
            "durable",
            StoreRole::Authoritative,
            durable.clone(),
            config.stores,
            Arc::new(FallbackCache::new()),
            metrics.clone(),
        ));
        let ranked_adapter: Arc<dyn StoreAdapter> = Arc::new(FaultTolerant::new(
            "ranked",
            StoreRole::Ranked,
            MemoryRankedStore::new(),
            config.stores,
            Arc::new(FallbackCache::new()),
            metrics.clone(),
        ));

        let guarded_votes: Arc<dyn VoteStore> = Arc::new(FaultTolerantVotes::new(
            votes.clone(),
            config.vote_store,
            metrics.clone(),
        ));

        let bus: Arc<dyn NotificationBus> = Arc::new(MemoryBus::new());
        let replicator = ElectionReplicator::new(
            candidates.clone(),
            votes.clone(),
            durable,
            vec![durable_adapter, ranked_adapter.clone()],
            bus.clone(),
        );
        let subscriber = ElectionSubscriber::new(ranked_adapter, candidates);

        Self {
            admission: Arc::new(AdmissionController::new(
                config.admission.clone(),
                metrics.clone(),
            )),
            processor: Arc::new(VoteProcessor::new(
                guarded_votes,
                config.processor,
                metrics.clone(),
            )),
            replicator: Arc::new(replicator),
            subscriber: Arc::new(subscriber),
            bus,
            metrics,
        }
    }

    /// Start the notification listener, the idle bucket sweep and periodic
    /// replication.
    pub fn start_background(&self, config: &Config) -> Background {
        let listener = self.subscriber.clone().spawn(self.bus.as_ref());

        let admission = self.admission.clone();
        let sweeper = PeriodicTask::new("bucket sweep", config.sweep_interval(), move || {
            let admission = admission.clone();
            async move {
                let evicted = admission.evict_idle();
                debug!("Evicted {evicted} idle rate buckets");
            }
        });

        let replicator = self.replicator.clone();
        let replication = PeriodicTask::new(
            "replication",
            config.replication_interval(),
            move || {
                let replicator = replicator.clone();
                async move {
                    let reports = replicator.resubmit_all().await;
                    info!("Periodic replication resubmitted {} elections", reports.len());
                }
            },
        );

        Background {
            listener,
            sweeper,
            replication,
        }
    }
}

/// Handles on the pipeline's background work.
pub struct Background {
    listener: JoinHandle<()>,
    sweeper: PeriodicTask,
    replication: PeriodicTask,
}

impl Background {
    /// Replicate every known election straight away.
    pub fn replicate_now(&self) {
        self.replication.trigger_now();
    }

    pub fn stop(self) {
        info!("Stopping background tasks");
        self.listener.abort();
        self.sweeper.cancel();
        self.replication.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rocket::tokio::time::sleep;

    use super::*;
    use crate::model::Vote;
    use crate::processor::Strategy;

    #[rocket::async_test]
    async fn background_replication_feeds_ranking() {
        let config = Config {
            replication_interval_secs: 3600,
            ..Config::default()
        };
        let pipeline = Pipeline::in_memory(&config, [Candidate::example1(), Candidate::example2()]);
        let background = pipeline.start_background(&config);

        pipeline.replicator.resubmit("e1").await.unwrap();
        let votes = vec![
            Vote::new("e1", "c1", "v1").unwrap(),
            Vote::new("e1", "c2", "v2").unwrap(),
            Vote::new("e1", "c1", "v3").unwrap(),
        ];
        pipeline.processor.process(votes, Strategy::Sequential).await;
        background.replicate_now();

        let mut ranking = None;
        for _ in 0..100 {
            ranking = pipeline
                .subscriber
                .view("e1")
                .filter(|view| view.total_votes() == 3);
            if ranking.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let view = ranking.unwrap();
        assert_eq!(view.votes_for("c1"), Some(2));
        assert_eq!(view.votes_for("c2"), Some(1));

        let elections = pipeline.replicator.find_all().await.unwrap();
        assert_eq!(elections.len(), 1);
        assert_eq!(elections[0].votes_for("c1"), Some(2));

        background.stop();
    }
}
