use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use log::debug;
use mongodb::{
    bson::doc,
    error::Error as DbError,
    options::{IndexOptions, ReplaceOptions},
    Client, Collection, Database, IndexModel,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::model::{Candidate, Election, Vote};

use super::{CandidateSource, ElectionQuery, ElectionStore, StoreError, VoteStore};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// An election, keyed by its ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ElectionRow {
    #[serde(rename = "_id")]
    id: String,
}

/// The tally of one candidate in one election, keyed by
/// `(election_id, candidate.id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ElectionCandidateRow {
    election_id: String,
    candidate: Candidate,
    votes: u64,
}

/// The latest vote of one voter in one election, keyed by
/// `(election_id, voter_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VoteRow {
    election_id: String,
    voter_id: String,
    candidate_id: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    cast_at: DateTime<Utc>,
}

const ELECTIONS: &str = "elections";
impl MongoCollection for ElectionRow {
    const NAME: &'static str = ELECTIONS;
}

const ELECTION_CANDIDATES: &str = "election_candidates";
impl MongoCollection for ElectionCandidateRow {
    const NAME: &'static str = ELECTION_CANDIDATES;
}

const VOTES: &str = "votes";
impl MongoCollection for VoteRow {
    const NAME: &'static str = VOTES;
}

const CANDIDATES: &str = "candidates";
impl MongoCollection for Candidate {
    const NAME: &'static str = CANDIDATES;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    let tally_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "candidate.id": 1})
        .options(unique.clone())
        .build();
    Coll::<ElectionCandidateRow>::from_db(db)
        .create_index(tally_index, None)
        .await?;

    let vote_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "voter_id": 1})
        .options(unique.clone())
        .build();
    Coll::<VoteRow>::from_db(db)
        .create_index(vote_index, None)
        .await?;

    let candidate_index = IndexModel::builder()
        .keys(doc! {"id": 1})
        .options(unique)
        .build();
    Coll::<Candidate>::from_db(db)
        .create_index(candidate_index, None)
        .await?;

    Ok(())
}

/// The authoritative election store, backed by MongoDB.
///
/// Each submission is written in a single transaction, so it needs a
/// deployment that supports them (a replica set or sharded cluster).
pub struct MongoElectionStore {
    client: Client,
    elections: Coll<ElectionRow>,
    tallies: Coll<ElectionCandidateRow>,
}

impl MongoElectionStore {
    pub fn new(client: Client, db: &Database) -> Self {
        Self {
            client,
            elections: Coll::from_db(db),
            tallies: Coll::from_db(db),
        }
    }

    async fn rows(&self, election_id: &str) -> Result<Vec<ElectionCandidateRow>, DbError> {
        self.tallies
            .find(doc! {"election_id": election_id}, None)
            .await?
            .try_collect()
            .await
    }
}

#[rocket::async_trait]
impl ElectionStore for MongoElectionStore {
    async fn submit(&self, election: &Election) -> Result<(), StoreError> {
        let upsert = ReplaceOptions::builder().upsert(true).build();

        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        let row = ElectionRow {
            id: election.id.clone(),
        };
        self.elections
            .replace_one_with_session(
                doc! {"_id": election.id.as_str()},
                &row,
                upsert.clone(),
                &mut session,
            )
            .await?;

        for (candidate_id, tally) in &election.tally {
            let row = ElectionCandidateRow {
                election_id: election.id.clone(),
                candidate: tally.candidate.clone(),
                votes: tally.votes,
            };
            self.tallies
                .replace_one_with_session(
                    doc! {"election_id": election.id.as_str(), "candidate.id": candidate_id.as_str()},
                    &row,
                    upsert.clone(),
                    &mut session,
                )
                .await?;
        }

        session.commit_transaction().await?;
        Ok(())
    }

    async fn sync(&self, election: &Election) -> Result<Election, StoreError> {
        let scores = self
            .rows(&election.id)
            .await?
            .into_iter()
            .map(|row| (row.candidate.id, row.votes));
        Ok(election.with_scores(scores))
    }
}

#[rocket::async_trait]
impl ElectionQuery for MongoElectionStore {
    async fn find_all(&self) -> Result<Vec<Election>, StoreError> {
        let rows: Vec<ElectionCandidateRow> =
            self.tallies.find(None, None).await?.try_collect().await?;

        let mut grouped: BTreeMap<String, Vec<(Candidate, u64)>> = BTreeMap::new();
        for row in rows {
            grouped
                .entry(row.election_id)
                .or_default()
                .push((row.candidate, row.votes));
        }
        Ok(grouped
            .into_iter()
            .map(|(id, tallies)| Election::from_tallies(id, tallies))
            .collect())
    }
}

/// Vote persistence backed by MongoDB.
pub struct MongoVoteStore {
    votes: Coll<VoteRow>,
}

impl MongoVoteStore {
    pub fn new(db: &Database) -> Self {
        Self {
            votes: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl VoteStore for MongoVoteStore {
    async fn save(&self, vote: &Vote) -> Result<(), StoreError> {
        let row = VoteRow {
            election_id: vote.election_id().to_string(),
            voter_id: vote.voter_id().to_string(),
            candidate_id: vote.candidate_id().to_string(),
            cast_at: vote.timestamp(),
        };
        let upsert = ReplaceOptions::builder().upsert(true).build();
        self.votes
            .replace_one(
                doc! {"election_id": vote.election_id(), "voter_id": vote.voter_id()},
                &row,
                upsert,
            )
            .await?;
        Ok(())
    }

    async fn count_by_candidate(
        &self,
        election_id: &str,
        candidate_id: &str,
    ) -> Result<u64, StoreError> {
        let filter = doc! {"election_id": election_id, "candidate_id": candidate_id};
        Ok(self.votes.count_documents(filter, None).await?)
    }

    async fn count_by_election(&self, election_id: &str) -> Result<u64, StoreError> {
        let filter = doc! {"election_id": election_id};
        Ok(self.votes.count_documents(filter, None).await?)
    }
}

/// Read-only view of the candidates collection.
pub struct MongoCandidateStore {
    candidates: Coll<Candidate>,
}

impl MongoCandidateStore {
    pub fn new(db: &Database) -> Self {
        Self {
            candidates: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl CandidateSource for MongoCandidateStore {
    async fn find_all(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.candidates.find(None, None).await?.try_collect().await?)
    }
}
