use std::collections::BTreeMap;

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

/// Length of randomly generated election IDs.
const ELECTION_ID_LENGTH: usize = 12;

/// A candidate standing in elections. Immutable once created and referenced
/// by `id` everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub given_name: String,
    pub family_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
}

impl Candidate {
    /// A candidate with only the mandatory fields set.
    pub fn new(
        id: impl Into<String>,
        given_name: impl Into<String>,
        family_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            given_name: given_name.into(),
            family_name: family_name.into(),
            email: email.into(),
            photo: None,
            phone: None,
            job_title: None,
        }
    }
}

/// A candidate and the number of votes they hold in one election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub candidate: Candidate,
    pub votes: u64,
}

/// A snapshot of an election: every candidate and their current tally.
///
/// Snapshots are rebuilt from scratch for every submission rather than
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    pub id: String,
    /// Tallies keyed by candidate ID.
    pub tally: BTreeMap<String, CandidateTally>,
}

impl Election {
    /// Create a brand new election with a random ID in which every candidate
    /// starts with no votes.
    pub fn create(candidates: impl IntoIterator<Item = Candidate>) -> Self {
        Self::blank(random_election_id(), candidates)
    }

    /// An election with the given ID in which every candidate has no votes.
    pub fn blank(id: impl Into<String>, candidates: impl IntoIterator<Item = Candidate>) -> Self {
        Self::from_tallies(id, candidates.into_iter().map(|c| (c, 0)))
    }

    pub fn from_tallies(
        id: impl Into<String>,
        tallies: impl IntoIterator<Item = (Candidate, u64)>,
    ) -> Self {
        let tally = tallies
            .into_iter()
            .map(|(candidate, votes)| (candidate.id.clone(), CandidateTally { candidate, votes }))
            .collect();
        Self {
            id: id.into(),
            tally,
        }
    }

    /// The vote count of the given candidate, if they stand in this election.
    pub fn votes_for(&self, candidate_id: &str) -> Option<u64> {
        self.tally.get(candidate_id).map(|t| t.votes)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.tally.values().map(|t| &t.candidate)
    }

    pub fn total_votes(&self) -> u64 {
        self.tally.values().map(|t| t.votes).sum()
    }

    /// Merge externally stored scores into this election's candidate set.
    ///
    /// Candidates of this election take the stored score, or zero if the
    /// store has none for them. Scores for candidates outside this election
    /// are ignored.
    pub fn with_scores(&self, scores: impl IntoIterator<Item = (String, u64)>) -> Self {
        let scores: BTreeMap<String, u64> = scores.into_iter().collect();
        let tally = self
            .tally
            .iter()
            .map(|(id, t)| {
                let votes = scores.get(id).copied().unwrap_or(0);
                (
                    id.clone(),
                    CandidateTally {
                        candidate: t.candidate.clone(),
                        votes,
                    },
                )
            })
            .collect();
        Self {
            id: self.id.clone(),
            tally,
        }
    }

    /// Candidates ordered by descending vote count, ties broken by ID.
    pub fn ranking(&self) -> Vec<&CandidateTally> {
        let mut ranked: Vec<_> = self.tally.values().collect();
        ranked.sort_by(|a, b| {
            b.votes
                .cmp(&a.votes)
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });
        ranked
    }
}

fn random_election_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ELECTION_ID_LENGTH)
        .map(char::from)
        .collect()
}
