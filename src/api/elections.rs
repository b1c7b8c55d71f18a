use rocket::{http::ContentType, serde::json::Json, Route, State};

use crate::admission::TrafficClass;
use crate::error::{Error, Result};
use crate::model::{CandidateTally, Election};
use crate::pipeline::Pipeline;
use crate::replicator::SubmissionReport;

use super::{admit, ClientIdentity};

pub fn routes() -> Vec<Route> {
    routes![
        elections,
        ranking,
        create_election,
        submit_election,
        metrics,
    ]
}

#[get("/elections")]
async fn elections(client: ClientIdentity, pipeline: &State<Pipeline>) -> Result<Json<Vec<Election>>> {
    admit(pipeline, TrafficClass::Query, &client.0)?;
    Ok(Json(pipeline.replicator.find_all().await?))
}

/// The latest ranking received through election notifications.
#[get("/elections/<election_id>/ranking")]
async fn ranking(
    election_id: &str,
    client: ClientIdentity,
    pipeline: &State<Pipeline>,
) -> Result<Json<Vec<CandidateTally>>> {
    admit(pipeline, TrafficClass::Query, &client.0)?;
    pipeline
        .subscriber
        .ranking(election_id)
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("Ranking for election '{election_id}'")))
}

#[post("/elections")]
async fn create_election(
    client: ClientIdentity,
    pipeline: &State<Pipeline>,
) -> Result<Json<SubmissionReport>> {
    admit(pipeline, TrafficClass::Admin, &client.0)?;
    Ok(Json(pipeline.replicator.submit().await?))
}

#[post("/elections/<election_id>/submit")]
async fn submit_election(
    election_id: &str,
    client: ClientIdentity,
    pipeline: &State<Pipeline>,
) -> Result<Json<SubmissionReport>> {
    admit(pipeline, TrafficClass::Admin, &client.0)?;
    Ok(Json(pipeline.replicator.resubmit(election_id).await?))
}

/// Pipeline metrics in the Prometheus text exposition format.
#[get("/metrics")]
async fn metrics(
    client: ClientIdentity,
    pipeline: &State<Pipeline>,
) -> Result<(ContentType, String)> {
    admit(pipeline, TrafficClass::Query, &client.0)?;
    pipeline.metrics.set_rate_buckets(&pipeline.admission.stats());
    Ok((ContentType::Plain, pipeline.metrics.encode()?))
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{serde_json::json, Value},
    };

    use super::*;
    use crate::model::Vote;
    use crate::processor::Strategy;

    #[backend_test]
    async fn create_then_list(client: Client) {
        let response = client.post(uri!(create_election)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let report: Value = response.into_json().await.unwrap();
        let election_id = report["election_id"].as_str().unwrap().to_string();
        assert_eq!(report["notified"], json!(true));
        assert_eq!(report["statuses"][0]["status"], json!("ok"));
        assert_eq!(report["statuses"][1]["status"], json!("ok"));

        let response = client.get(uri!(elections)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let elections: Vec<Election> = response.into_json().await.unwrap();
        assert_eq!(elections.len(), 1);
        assert_eq!(elections[0].id, election_id);
        assert_eq!(elections[0].total_votes(), 0);
        assert_eq!(elections[0].candidates().count(), 2);
    }

    #[backend_test]
    async fn resubmitted_tallies_reach_ranking(client: Client, pipeline: Pipeline) {
        let votes = vec![
            Vote::new("e1", "c1", "v1").unwrap(),
            Vote::new("e1", "c2", "v2").unwrap(),
            Vote::new("e1", "c1", "v3").unwrap(),
        ];
        pipeline.processor.process(votes, Strategy::Sequential).await;

        let response = client.get(uri!(ranking("e1"))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());

        let response = client.post(uri!(submit_election("e1"))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let report: Value = response.into_json().await.unwrap();
        assert_eq!(report["election_id"], json!("e1"));
        assert_eq!(report["statuses"][1]["name"], json!("ranked"));
        assert_eq!(report["statuses"][1]["status"], json!("ok"));

        pipeline.subscriber.handle("e1").await.unwrap();
        let response = client.get(uri!(ranking("e1"))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let ranking: Vec<CandidateTally> = response.into_json().await.unwrap();
        let ranking: Vec<_> = ranking
            .iter()
            .map(|t| (t.candidate.id.as_str(), t.votes))
            .collect();
        assert_eq!(ranking, vec![("c1", 2), ("c2", 1)]);
    }

    #[backend_test]
    async fn metrics_report_activity(client: Client) {
        let response = client
            .post("/votes")
            .header(ContentType::JSON)
            .body(json!({"election_id": "e1", "candidate_id": "c1", "voter_id": "v1"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());

        let response = client.get(uri!(metrics)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        assert_eq!(Some(ContentType::Plain), response.content_type());
        let metrics = response.into_string().await.unwrap();
        assert!(metrics.contains("votes_total 1"));
        assert!(metrics.contains("votes_success_total 1"));
        assert!(metrics.contains("ratelimit_voting_buckets 1"));
        assert!(metrics.contains("ratelimit_query_buckets 1"));
        assert!(metrics.contains("vote_processing_time_ms_count 1"));
    }
}
