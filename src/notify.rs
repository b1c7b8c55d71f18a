use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, error, info, warn};
use rocket::tokio::{
    self,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use thiserror::Error;

use crate::model::{CandidateTally, Election};
use crate::store::{CandidateSource, StoreAdapter, StoreError};

/// Topic carrying the IDs of elections that have just been replicated.
pub const ELECTIONS_TOPIC: &str = "elections";

/// Messages buffered per topic before slow subscribers start to lag.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
}

/// A publish/subscribe channel keyed by topic.
#[rocket::async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), NotifyError>;

    fn subscribe(&self, topic: &str) -> Subscription;
}

/// A stream of payloads published to one topic.
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    /// The next payload, or `None` once the bus has gone away.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber on {} lagged, {skipped} messages skipped", self.topic);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// An in-process notification bus.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[rocket::async_trait]
impl NotificationBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), NotifyError> {
        // Nobody listening is not an error.
        let receivers = self.sender(topic).send(payload.to_string()).unwrap_or(0);
        debug!("Published {payload} to {topic} ({receivers} receivers)");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            receiver: self.sender(topic).subscribe(),
        }
    }
}

/// Keeps a local ranked view of every election announced on
/// [`ELECTIONS_TOPIC`], synced from the ranked store.
pub struct ElectionSubscriber {
    ranked: Arc<dyn StoreAdapter>,
    candidates: Arc<dyn CandidateSource>,
    views: RwLock<HashMap<String, Election>>,
}

impl ElectionSubscriber {
    pub fn new(ranked: Arc<dyn StoreAdapter>, candidates: Arc<dyn CandidateSource>) -> Self {
        Self {
            ranked,
            candidates,
            views: RwLock::new(HashMap::new()),
        }
    }

    /// Listen on the bus until it closes.
    ///
    /// The subscription is taken before returning, so nothing published
    /// after this call is missed.
    pub fn spawn(self: Arc<Self>, bus: &dyn NotificationBus) -> JoinHandle<()> {
        let mut subscription = bus.subscribe(ELECTIONS_TOPIC);
        tokio::spawn(async move {
            info!("Listening for elections on topic {ELECTIONS_TOPIC}");
            while let Some(election_id) = subscription.next().await {
                if let Err(err) = self.handle(&election_id).await {
                    error!("Failed to sync election {election_id} from notification: {err}");
                }
            }
            info!("Election notifications closed");
        })
    }

    /// Sync the named election from the ranked store into the local view.
    pub async fn handle(&self, election_id: &str) -> Result<Election, StoreError> {
        let candidates = self.candidates.find_all().await?;
        let template = Election::blank(election_id, candidates);
        let synced = self.ranked.sync(&template).await;
        info!(
            "Synced election {election_id} from {} store: {} votes",
            self.ranked.name(),
            synced.total_votes()
        );
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(election_id.to_string(), synced.clone());
        Ok(synced)
    }

    /// The latest synced view of an election.
    pub fn view(&self, election_id: &str) -> Option<Election> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(election_id)
            .cloned()
    }

    /// The ranking of an election as last synced.
    pub fn ranking(&self, election_id: &str) -> Option<Vec<CandidateTally>> {
        self.view(election_id)
            .map(|election| election.ranking().into_iter().cloned().collect())
    }
}
