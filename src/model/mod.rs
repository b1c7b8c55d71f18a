pub use election::{Candidate, CandidateTally, Election};
pub use vote::{BatchStatus, BatchVoteResult, InvalidVote, Vote, VoteRequest, VoteResult};

mod election;
mod vote;
