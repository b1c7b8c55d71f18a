use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{Candidate, Election, Vote};

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, Permit};
pub use cache::FallbackCache;
pub use fault_tolerant::{FaultGuard, FaultPolicy, FaultTolerant, FaultTolerantVotes};
pub use memory::{
    ranked_key, MemoryCandidateStore, MemoryDurableStore, MemoryRankedStore, MemoryVoteStore,
};
pub use mongo::{ensure_indexes_exist, MongoCandidateStore, MongoElectionStore, MongoVoteStore};

mod breaker;
mod cache;
mod fault_tolerant;
mod memory;
mod mongo;

#[cfg(test)]
pub(crate) use fault_tolerant::tests as testing;

/// Errors raised by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Store call panicked")]
    Panicked,
    #[error(transparent)]
    Db(#[from] mongodb::error::Error),
}

/// The role a store plays in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    /// The durable source of truth, also answering queries.
    Authoritative,
    /// The fast ranked-read store.
    Ranked,
}

impl Display for StoreRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authoritative => write!(f, "authoritative"),
            Self::Ranked => write!(f, "ranked"),
        }
    }
}

/// What happened to an election submitted to one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// The store accepted the election.
    Ok,
    /// The store could not be reached; the election is held in the adapter's
    /// fallback cache instead.
    Cached,
    /// The submission was lost entirely.
    Failed,
}

/// A raw backing store for elections. Calls may fail; fault tolerance is
/// layered on top by [`FaultTolerant`].
#[rocket::async_trait]
pub trait ElectionStore: Send + Sync {
    /// Write the given election snapshot.
    async fn submit(&self, election: &Election) -> Result<(), StoreError>;

    /// Reconcile the given election against the store, returning the store's
    /// view restricted to the election's candidate set.
    async fn sync(&self, election: &Election) -> Result<Election, StoreError>;
}

#[rocket::async_trait]
impl<S> ElectionStore for Arc<S>
where
    S: ElectionStore + ?Sized,
{
    async fn submit(&self, election: &Election) -> Result<(), StoreError> {
        (**self).submit(election).await
    }

    async fn sync(&self, election: &Election) -> Result<Election, StoreError> {
        (**self).sync(election).await
    }
}

/// Read access to every election held by the authoritative store.
#[rocket::async_trait]
pub trait ElectionQuery: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Election>, StoreError>;
}

/// The uniform, failure-absorbing interface the replicator fans out to.
#[rocket::async_trait]
pub trait StoreAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> StoreRole;

    fn breaker_state(&self) -> BreakerState;

    /// Submit an election. Never fails: store errors are reported through the
    /// returned status.
    async fn submit(&self, election: &Election) -> SubmitStatus;

    /// Sync an election, falling back to the last known good copy or, failing
    /// that, to the input itself.
    async fn sync(&self, election: &Election) -> Election;
}

/// Persistence for individual votes.
///
/// Saving is idempotent per `(voter, election)`: a later vote from the same
/// voter in the same election replaces the earlier one.
#[rocket::async_trait]
pub trait VoteStore: Send + Sync {
    async fn save(&self, vote: &Vote) -> Result<(), StoreError>;

    async fn count_by_candidate(
        &self,
        election_id: &str,
        candidate_id: &str,
    ) -> Result<u64, StoreError>;

    async fn count_by_election(&self, election_id: &str) -> Result<u64, StoreError>;
}

/// Read-only access to the candidate list.
#[rocket::async_trait]
pub trait CandidateSource: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Candidate>, StoreError>;
}
