use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A vote was rejected before any processing took place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidVote {
    #[error("Election ID cannot be blank")]
    BlankElectionId,
    #[error("Candidate ID cannot be blank")]
    BlankCandidateId,
    #[error("Voter ID cannot be blank")]
    BlankVoterId,
}

/// A single vote for a candidate in an election.
///
/// Votes are immutable once created; the timestamp is always assigned at
/// creation time rather than taken from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vote {
    election_id: String,
    candidate_id: String,
    voter_id: String,
    timestamp: DateTime<Utc>,
}

impl Vote {
    /// Create a new vote stamped with the current time.
    pub fn new(
        election_id: impl Into<String>,
        candidate_id: impl Into<String>,
        voter_id: impl Into<String>,
    ) -> Result<Self, InvalidVote> {
        let election_id = election_id.into();
        let candidate_id = candidate_id.into();
        let voter_id = voter_id.into();

        if election_id.trim().is_empty() {
            return Err(InvalidVote::BlankElectionId);
        }
        if candidate_id.trim().is_empty() {
            return Err(InvalidVote::BlankCandidateId);
        }
        if voter_id.trim().is_empty() {
            return Err(InvalidVote::BlankVoterId);
        }

        Ok(Self {
            election_id,
            candidate_id,
            voter_id,
            timestamp: Utc::now(),
        })
    }

    pub fn election_id(&self) -> &str {
        &self.election_id
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn voter_id(&self) -> &str {
        &self.voter_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The idempotency key of this vote. A voter has at most one stored vote
    /// per election; a later vote with the same key replaces the earlier one.
    pub fn key(&self) -> String {
        format!("{}:{}", self.election_id, self.voter_id)
    }
}

/// A vote as submitted over the API, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub election_id: String,
    pub candidate_id: String,
    pub voter_id: String,
}

impl TryFrom<VoteRequest> for Vote {
    type Error = InvalidVote;

    fn try_from(request: VoteRequest) -> Result<Self, Self::Error> {
        Vote::new(request.election_id, request.candidate_id, request.voter_id)
    }
}

/// The outcome of processing a single vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResult {
    pub vote_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
}

impl VoteResult {
    pub fn success(vote_id: impl Into<String>, processing_time_ms: u64) -> Self {
        Self {
            vote_id: vote_id.into(),
            success: true,
            error_message: None,
            processing_time_ms,
        }
    }

    pub fn failure(
        vote_id: impl Into<String>,
        error_message: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            vote_id: vote_id.into(),
            success: false,
            error_message: Some(error_message.into()),
            processing_time_ms,
        }
    }
}

/// Whether every submitted vote of a batch produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    Complete,
    /// The batch was cut short by a forced shutdown. The missing votes may or
    /// may not have been persisted and must be reconciled by the caller.
    Unresolved { missing: usize },
}

/// Aggregate outcome of processing a batch of votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchVoteResult {
    pub total_votes: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_processing_time_ms: u64,
    pub average_time_per_vote: f64,
    /// Percentage of results that succeeded, 0 for an empty batch.
    pub success_rate: f64,
    pub submitted_votes: usize,
    pub status: BatchStatus,
    pub results: Vec<VoteResult>,
}

impl BatchVoteResult {
    /// Summarise the given results. `submitted` is the number of votes that
    /// were handed to the processor, which exceeds `results.len()` only if
    /// the batch was force-terminated.
    pub fn from_results(results: Vec<VoteResult>, submitted: usize, elapsed_ms: u64) -> Self {
        let total_votes = results.len();
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = total_votes - success_count;
        let (average_time_per_vote, success_rate) = if total_votes > 0 {
            (
                elapsed_ms as f64 / total_votes as f64,
                success_count as f64 / total_votes as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };
        let status = if total_votes >= submitted {
            BatchStatus::Complete
        } else {
            BatchStatus::Unresolved {
                missing: submitted - total_votes,
            }
        };

        Self {
            total_votes,
            success_count,
            failure_count,
            total_processing_time_ms: elapsed_ms,
            average_time_per_vote,
            success_rate,
            submitted_votes: submitted,
            status,
            results,
        }
    }

    /// Fold in votes that were refused before processing, such as those
    /// rejected by admission control. Each counts as submitted and failed.
    pub fn with_rejected(mut self, rejected: Vec<VoteResult>) -> Self {
        let submitted = self.submitted_votes + rejected.len();
        self.results.extend(rejected);
        Self::from_results(self.results, submitted, self.total_processing_time_ms)
    }

    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_are_rejected() {
        assert_eq!(Vote::new("", "c1", "v1"), Err(InvalidVote::BlankElectionId));
        assert_eq!(Vote::new("e1", "  ", "v1"), Err(InvalidVote::BlankCandidateId));
        assert_eq!(Vote::new("e1", "c1", "\t"), Err(InvalidVote::BlankVoterId));
        assert!(Vote::new("e1", "c1", "v1").is_ok());
    }

    #[test]
    fn vote_key_is_voter_per_election() {
        let first = Vote::new("e1", "c1", "v1").unwrap();
        let second = Vote::new("e1", "c2", "v1").unwrap();
        assert_eq!(first.key(), second.key());
        assert_ne!(first.key(), Vote::new("e2", "c1", "v1").unwrap().key());
    }

    #[test]
    fn batch_result_counts() {
        let results = vec![
            VoteResult::success("e1:v1", 10),
            VoteResult::failure("e1:v2", "store unavailable", 12),
            VoteResult::success("e1:v3", 11),
        ];
        let batch = BatchVoteResult::from_results(results, 3, 60);

        assert_eq!(batch.total_votes, 3);
        assert_eq!(batch.success_count, 2);
        assert_eq!(batch.failure_count, 1);
        assert_eq!(batch.average_time_per_vote, 20.0);
        assert!(batch.is_complete());
        assert!((batch.success_rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn success_rate_is_serialized() {
        use rocket::serde::json::serde_json;

        let results = vec![
            VoteResult::success("e1:v1", 10),
            VoteResult::failure("e1:v2", "store unavailable", 12),
        ];
        let batch = BatchVoteResult::from_results(results, 2, 20);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["success_rate"], serde_json::json!(50.0));
    }

    #[test]
    fn rejected_votes_count_as_failures() {
        let batch = BatchVoteResult::from_results(vec![VoteResult::success("e1:v1", 10)], 1, 10)
            .with_rejected(vec![VoteResult::failure("e1:v2", "Rate limit exceeded", 0)]);
        assert_eq!(batch.total_votes, 2);
        assert_eq!(batch.submitted_votes, 2);
        assert_eq!(batch.failure_count, 1);
        assert_eq!(batch.success_rate, 50.0);
        assert!(batch.is_complete());
    }

    #[test]
    fn empty_batch_has_zero_average() {
        let batch = BatchVoteResult::from_results(Vec::new(), 0, 5);
        assert_eq!(batch.total_votes, 0);
        assert_eq!(batch.average_time_per_vote, 0.0);
        assert_eq!(batch.success_rate, 0.0);
    }

    #[test]
    fn missing_results_mark_batch_unresolved() {
        let results = vec![VoteResult::success("e1:v1", 10)];
        let batch = BatchVoteResult::from_results(results, 4, 10);
        assert_eq!(batch.status, BatchStatus::Unresolved { missing: 3 });
        assert!(!batch.is_complete());
    }
}
