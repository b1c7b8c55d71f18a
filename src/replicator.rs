use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use log::{error, info, warn};
use rocket::tokio;
use serde::Serialize;

use crate::model::{Candidate, Election};
use crate::notify::{NotificationBus, ELECTIONS_TOPIC};
use crate::store::{
    CandidateSource, ElectionQuery, StoreAdapter, StoreError, StoreRole, SubmitStatus, VoteStore,
};

/// The outcome of submitting an election to one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStatus {
    pub name: String,
    pub role: StoreRole,
    pub status: SubmitStatus,
}

/// The outcome of one replication cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub election_id: String,
    /// One entry per adapter, in registration order.
    pub statuses: Vec<AdapterStatus>,
    /// Whether the change notification was published.
    pub notified: bool,
}

impl SubmissionReport {
    pub fn status_of(&self, name: &str) -> Option<SubmitStatus> {
        self.statuses
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.status)
    }
}

/// Builds election snapshots and fans them out to every registered store.
pub struct ElectionReplicator {
    candidates: Arc<dyn CandidateSource>,
    tallies: Arc<dyn VoteStore>,
    principal: Arc<dyn ElectionQuery>,
    adapters: Vec<Arc<dyn StoreAdapter>>,
    bus: Arc<dyn NotificationBus>,
    /// IDs of every election submitted through this replicator.
    known: RwLock<BTreeSet<String>>,
}

impl ElectionReplicator {
    pub fn new(
        candidates: Arc<dyn CandidateSource>,
        tallies: Arc<dyn VoteStore>,
        principal: Arc<dyn ElectionQuery>,
        adapters: Vec<Arc<dyn StoreAdapter>>,
        bus: Arc<dyn NotificationBus>,
    ) -> Self {
        Self {
            candidates,
            tallies,
            principal,
            adapters,
            bus,
            known: RwLock::new(BTreeSet::new()),
        }
    }

    /// Create a new election over the current candidates and replicate it.
    pub async fn submit(&self) -> Result<SubmissionReport, StoreError> {
        let candidates = self.candidates.find_all().await?;
        let election = Election::create(candidates);
        info!("Created election {}", election.id);
        Ok(self.replicate(election).await)
    }

    /// Rebuild an existing election from the current tallies and replicate it.
    pub async fn resubmit(&self, election_id: &str) -> Result<SubmissionReport, StoreError> {
        let election = self.snapshot(election_id).await?;
        Ok(self.replicate(election).await)
    }

    /// Resubmit every election this replicator has seen.
    pub async fn resubmit_all(&self) -> Vec<SubmissionReport> {
        let ids: Vec<String> = self
            .known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            match self.resubmit(&id).await {
                Ok(report) => reports.push(report),
                Err(err) => error!("Failed to rebuild election {id}: {err}"),
            }
        }
        reports
    }

    /// The current state of an election: every candidate with their tally
    /// from the vote store.
    pub async fn snapshot(&self, election_id: &str) -> Result<Election, StoreError> {
        let candidates = self.candidates.find_all().await?;
        let mut tallies: Vec<(Candidate, u64)> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let votes = self
                .tallies
                .count_by_candidate(election_id, &candidate.id)
                .await?;
            tallies.push((candidate, votes));
        }
        Ok(Election::from_tallies(election_id, tallies))
    }

    /// Every election held by the authoritative store.
    pub async fn find_all(&self) -> Result<Vec<Election>, StoreError> {
        self.principal.find_all().await
    }

    pub fn adapters(&self) -> &[Arc<dyn StoreAdapter>] {
        &self.adapters
    }

    async fn replicate(&self, election: Election) -> SubmissionReport {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(election.id.clone());

        let election = Arc::new(election);
        let handles: Vec<_> = self
            .adapters
            .iter()
            .map(|adapter| {
                let adapter = adapter.clone();
                let election = election.clone();
                tokio::spawn(async move { adapter.submit(&election).await })
            })
            .collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for (adapter, handle) in self.adapters.iter().zip(handles) {
            let status = match handle.await {
                Ok(status) => status,
                Err(err) => {
                    error!(
                        "Submission of election {} to {} store aborted: {err}",
                        election.id,
                        adapter.name()
                    );
                    SubmitStatus::Failed
                }
            };
            if status != SubmitStatus::Ok {
                warn!(
                    "Election {} not stored in {} store ({status:?})",
                    election.id,
                    adapter.name()
                );
            }
            statuses.push(AdapterStatus {
                name: adapter.name().to_string(),
                role: adapter.role(),
                status,
            });
        }

        let notified = match self.bus.publish(ELECTIONS_TOPIC, &election.id).await {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to announce election {}: {err}", election.id);
                false
            }
        };

        SubmissionReport {
            election_id: election.id.clone(),
            statuses,
            notified,
        }
    }
}
