use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::model::Election;

/// Last known good elections, keyed by election ID.
///
/// Each store adapter owns its own cache; caches are never shared between
/// stores.
#[derive(Debug, Default)]
pub struct FallbackCache {
    elections: RwLock<HashMap<String, Election>>,
}

impl FallbackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, election: Election) {
        self.elections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(election.id.clone(), election);
    }

    pub fn get(&self, election_id: &str) -> Option<Election> {
        self.elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(election_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
