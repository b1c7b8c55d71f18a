use rocket::{serde::json::Json, Route, State};

use crate::admission::TrafficClass;
use crate::error::{Error, Result};
use crate::model::{BatchVoteResult, Vote, VoteRequest, VoteResult};
use crate::pipeline::Pipeline;
use crate::processor::Strategy;

use super::admit;

pub fn routes() -> Vec<Route> {
    routes![cast_vote, cast_batch]
}

#[post("/votes", data = "<request>", format = "json")]
async fn cast_vote(request: Json<VoteRequest>, pipeline: &State<Pipeline>) -> Result<Json<VoteResult>> {
    let vote = Vote::try_from(request.into_inner())?;
    admit(pipeline, TrafficClass::Voting, vote.voter_id())?;
    Ok(Json(pipeline.processor.submit_vote(vote).await))
}

/// Process a batch of votes. Each vote is charged to its own voter's
/// bucket; votes refused admission come back as failed results.
#[post("/votes/batch?<strategy>", data = "<requests>", format = "json")]
async fn cast_batch(
    requests: Json<Vec<VoteRequest>>,
    strategy: Option<Strategy>,
    pipeline: &State<Pipeline>,
) -> Result<Json<BatchVoteResult>> {
    // Reject the whole batch if any vote is malformed.
    let votes = requests
        .into_inner()
        .into_iter()
        .map(Vote::try_from)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut admitted = Vec::with_capacity(votes.len());
    let mut rejected = Vec::new();
    for vote in votes {
        let decision = pipeline
            .admission
            .try_admit(TrafficClass::Voting, vote.voter_id());
        if decision.allowed {
            admitted.push(vote);
        } else {
            let message = Error::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            }
            .to_string();
            rejected.push(VoteResult::failure(vote.key(), message, 0));
        }
    }

    let strategy = strategy.unwrap_or_default();
    let batch = pipeline.processor.process(admitted, strategy).await;
    Ok(Json(batch.with_rejected(rejected)))
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::serde_json::json,
    };

    use super::*;
    use crate::model::BatchStatus;

    #[backend_test]
    async fn cast_single_vote(client: Client, pipeline: Pipeline) {
        let response = client
            .post(uri!(cast_vote))
            .header(ContentType::JSON)
            .body(json!({"election_id": "e1", "candidate_id": "c1", "voter_id": "v1"}).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::Ok, response.status());
        let result: VoteResult = response.into_json().await.unwrap();
        assert!(result.success);
        assert_eq!(result.vote_id, "e1:v1");
        assert_eq!(pipeline.metrics.votes_success.get(), 1);
    }

    #[backend_test]
    async fn blank_fields_are_rejected(client: Client, pipeline: Pipeline) {
        let response = client
            .post(uri!(cast_vote))
            .header(ContentType::JSON)
            .body(json!({"election_id": "e1", "candidate_id": " ", "voter_id": "v1"}).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::BadRequest, response.status());
        assert_eq!(pipeline.metrics.votes_total.get(), 0);
    }

    #[backend_test]
    async fn eleventh_vote_is_rate_limited(client: Client, pipeline: Pipeline) {
        for candidate in 0..10 {
            let response = client
                .post(uri!(cast_vote))
                .header(ContentType::JSON)
                .body(
                    json!({"election_id": "e1", "candidate_id": format!("c{candidate}"), "voter_id": "v1"})
                        .to_string(),
                )
                .dispatch()
                .await;
            assert_eq!(Status::Ok, response.status());
        }

        let response = client
            .post(uri!(cast_vote))
            .header(ContentType::JSON)
            .body(json!({"election_id": "e1", "candidate_id": "c1", "voter_id": "v1"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::TooManyRequests, response.status());
        let retry_after: u64 = response
            .headers()
            .get_one("Retry-After")
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0);
        assert_eq!(pipeline.metrics.rate_limit_hits.get(), 1);

        // Other voters have their own bucket.
        let response = client
            .post(uri!(cast_vote))
            .header(ContentType::JSON)
            .body(json!({"election_id": "e1", "candidate_id": "c1", "voter_id": "v2"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
    }

    #[backend_test]
    async fn cast_batch_with_strategy(client: Client) {
        let votes: Vec<_> = (0..25)
            .map(|i| json!({"election_id": "e1", "candidate_id": "c1", "voter_id": format!("v{i}")}))
            .collect();

        let response = client
            .post("/votes/batch?strategy=bounded_pool")
            .header(ContentType::JSON)
            .body(json!(votes).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::Ok, response.status());
        let batch: BatchVoteResult = response.into_json().await.unwrap();
        assert_eq!(batch.total_votes, 25);
        assert_eq!(batch.success_count, 25);
        assert_eq!(batch.status, BatchStatus::Complete);
    }

    #[backend_test]
    async fn throttled_voter_cannot_vote_through_batch(client: Client, pipeline: Pipeline) {
        for candidate in 0..10 {
            let response = client
                .post(uri!(cast_vote))
                .header(ContentType::JSON)
                .body(
                    json!({"election_id": format!("e{candidate}"), "candidate_id": "c1", "voter_id": "v1"})
                        .to_string(),
                )
                .dispatch()
                .await;
            assert_eq!(Status::Ok, response.status());
        }

        let mut votes: Vec<_> = (0..50)
            .map(|i| json!({"election_id": format!("b{i}"), "candidate_id": "c1", "voter_id": "v1"}))
            .collect();
        votes.push(json!({"election_id": "b0", "candidate_id": "c1", "voter_id": "v2"}));

        let response = client
            .post("/votes/batch?strategy=sequential")
            .header(ContentType::JSON)
            .body(json!(votes).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::Ok, response.status());
        let batch: BatchVoteResult = response.into_json().await.unwrap();
        assert_eq!(batch.submitted_votes, 51);
        assert_eq!(batch.total_votes, 51);
        assert_eq!(batch.success_count, 1);
        assert_eq!(batch.failure_count, 50);
        assert_eq!(batch.status, BatchStatus::Complete);
        assert!(batch
            .results
            .iter()
            .filter(|r| !r.success)
            .all(|r| r.error_message.as_deref().unwrap().starts_with("Rate limit exceeded")));
        assert!(batch.results.iter().any(|r| r.success && r.vote_id == "b0:v2"));
        assert_eq!(pipeline.admission.available_tokens(TrafficClass::Voting, "v1"), Some(0));
        assert_eq!(pipeline.metrics.votes_total.get(), 11);
        assert_eq!(pipeline.metrics.rate_limit_hits.get(), 50);
    }

    #[backend_test]
    async fn malformed_batch_is_rejected(client: Client, pipeline: Pipeline) {
        let votes = json!([
            {"election_id": "e1", "candidate_id": "c1", "voter_id": "v1"},
            {"election_id": "", "candidate_id": "c1", "voter_id": "v2"},
        ]);

        let response = client
            .post("/votes/batch")
            .header(ContentType::JSON)
            .body(votes.to_string())
            .dispatch()
            .await;

        assert_eq!(Status::BadRequest, response.status());
        assert_eq!(pipeline.metrics.votes_total.get(), 0);
    }
}
