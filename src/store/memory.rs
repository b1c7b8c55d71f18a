use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::model::{Candidate, CandidateTally, Election, Vote};

use super::{CandidateSource, ElectionQuery, ElectionStore, StoreError, VoteStore};

/// The ranked-store key holding the tallies of an election.
pub fn ranked_key(election_id: &str) -> String {
    format!("election:{election_id}")
}

/// Durable tables, held in memory.
#[derive(Debug, Default)]
struct Tables {
    elections: BTreeSet<String>,
    /// Keyed by `(election_id, candidate_id)`.
    election_candidates: BTreeMap<(String, String), CandidateTally>,
}

/// An in-memory authoritative store. Every submission is applied under a
/// single lock, so readers never observe half an election.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    tables: RwLock<Tables>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored `(candidate_id, votes)` rows of an election.
    pub fn rows(&self, election_id: &str) -> Vec<(String, u64)> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .election_candidates
            .iter()
            .filter(|((election, _), _)| election == election_id)
            .map(|((_, candidate), tally)| (candidate.clone(), tally.votes))
            .collect()
    }
}

#[rocket::async_trait]
impl ElectionStore for MemoryDurableStore {
    async fn submit(&self, election: &Election) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.elections.insert(election.id.clone());
        for (candidate_id, tally) in &election.tally {
            tables
                .election_candidates
                .insert((election.id.clone(), candidate_id.clone()), tally.clone());
        }
        Ok(())
    }

    async fn sync(&self, election: &Election) -> Result<Election, StoreError> {
        Ok(election.with_scores(self.rows(&election.id)))
    }
}

#[rocket::async_trait]
impl ElectionQuery for MemoryDurableStore {
    async fn find_all(&self) -> Result<Vec<Election>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let elections = tables
            .elections
            .iter()
            .map(|id| {
                let tallies = tables
                    .election_candidates
                    .iter()
                    .filter(|((election, _), _)| election == id)
                    .map(|(_, tally)| (tally.candidate.clone(), tally.votes));
                Election::from_tallies(id.clone(), tallies)
            })
            .collect();
        Ok(elections)
    }
}

/// A sorted set: members ordered by score, with O(log n) updates.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, u64>,
    ordered: BTreeSet<(u64, String)>,
}

impl SortedSet {
    fn add(&mut self, member: String, score: u64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }
}

/// An in-memory ranked store: one sorted set per key.
#[derive(Debug, Default)]
pub struct MemoryRankedStore {
    sets: RwLock<HashMap<String, SortedSet>>,
}

impl MemoryRankedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update members of the sorted set at `key`.
    pub fn zadd(&self, key: &str, members: impl IntoIterator<Item = (String, u64)>) {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let set = sets.entry(key.to_string()).or_default();
        for (member, score) in members {
            set.add(member, score);
        }
    }

    /// All members of the set at `key` with their scores, lowest first.
    pub fn range_with_scores(&self, key: &str) -> Vec<(String, u64)> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.get(key)
            .map(|set| {
                set.ordered
                    .iter()
                    .map(|(score, member)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The score of one member, if present.
    #[cfg(test)]
    pub fn score(&self, key: &str, member: &str) -> Option<u64> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.get(key).and_then(|set| set.scores.get(member).copied())
    }
}

#[rocket::async_trait]
impl ElectionStore for MemoryRankedStore {
    async fn submit(&self, election: &Election) -> Result<(), StoreError> {
        let members = election
            .tally
            .iter()
            .map(|(candidate_id, tally)| (candidate_id.clone(), tally.votes));
        self.zadd(&ranked_key(&election.id), members);
        Ok(())
    }

    async fn sync(&self, election: &Election) -> Result<Election, StoreError> {
        let scores = self.range_with_scores(&ranked_key(&election.id));
        Ok(election.with_scores(scores))
    }
}

/// In-memory vote persistence holding the latest vote per voter and election.
#[derive(Debug, Default)]
pub struct MemoryVoteStore {
    /// `(election_id, voter_id)` to candidate ID.
    ballots: RwLock<HashMap<(String, String), String>>,
}

impl MemoryVoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct stored votes.
    pub fn len(&self) -> usize {
        self.ballots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[rocket::async_trait]
impl VoteStore for MemoryVoteStore {
    async fn save(&self, vote: &Vote) -> Result<(), StoreError> {
        self.ballots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (vote.election_id().to_string(), vote.voter_id().to_string()),
                vote.candidate_id().to_string(),
            );
        Ok(())
    }

    async fn count_by_candidate(
        &self,
        election_id: &str,
        candidate_id: &str,
    ) -> Result<u64, StoreError> {
        let ballots = self.ballots.read().unwrap_or_else(PoisonError::into_inner);
        let count = ballots
            .iter()
            .filter(|((election, _), candidate)| election == election_id && *candidate == candidate_id)
            .count();
        Ok(count as u64)
    }

    async fn count_by_election(&self, election_id: &str) -> Result<u64, StoreError> {
        let ballots = self.ballots.read().unwrap_or_else(PoisonError::into_inner);
        let count = ballots
            .keys()
            .filter(|(election, _)| election == election_id)
            .count();
        Ok(count as u64)
    }
}

/// A fixed, in-memory candidate list.
#[derive(Debug, Default)]
pub struct MemoryCandidateStore {
    candidates: Vec<Candidate>,
}

impl MemoryCandidateStore {
    pub fn new(candidates: impl IntoIterator<Item = Candidate>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
        }
    }
}

#[rocket::async_trait]
impl CandidateSource for MemoryCandidateStore {
    async fn find_all(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.candidates.clone())
    }
}
