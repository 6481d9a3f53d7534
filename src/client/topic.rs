// Topics travel by name, but in-flight calls are correlated by a 64-bit
// surrogate. The surrogate is only meaningful inside one client: every client
// draws fresh ahash seeds, so two clients hash the same topic differently and
// the remote side never relies on the numeric value.

use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use tracing::warn;

use super::error::{Error, Result};

pub type TopicHash = u64;

/// Reserved hash for one-way publishes. Never produced by [`TopicHasher`].
pub const PUBLISH_HASH: TopicHash = u64::MAX;

pub struct TopicHasher {
    state: ahash::RandomState,
    seen: Mutex<HashMap<TopicHash, Arc<str>>>,
}

impl TopicHasher {
    pub fn new() -> Self {
        Self {
            state: ahash::RandomState::new(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Hashes a topic without recording it.
    pub fn hash(&self, topic: &str) -> TopicHash {
        let hash = self.state.hash_one(topic);
        if hash == PUBLISH_HASH {
            hash ^ 1
        } else {
            hash
        }
    }

    /// Hashes a topic and remembers which name produced the value. Two
    /// distinct names landing on the same hash are reported as a protocol
    /// error rather than allowed to share routing state.
    pub fn register(&self, topic: &str) -> Result<TopicHash> {
        let hash = self.hash(topic);
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        match seen.get(&hash) {
            Some(known) if &**known != topic => {
                warn!(
                    %hash,
                    first = %known,
                    second = topic,
                    "topic hash collision"
                );
                Err(Error::protocol(format!(
                    "topic {topic:?} collides with {known:?} (hash {hash:#x})"
                )))
            }
            Some(_) => Ok(hash),
            None => {
                seen.insert(hash, Arc::from(topic));
                Ok(hash)
            }
        }
    }

    /// Number of distinct topics registered so far.
    pub fn known_topics(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for TopicHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ErrorKind;

    #[test]
    fn stable_within_an_instance() {
        let hasher = TopicHasher::new();
        assert_eq!(hasher.hash("echo"), hasher.hash("echo"));
        assert_eq!(hasher.register("echo").unwrap(), hasher.hash("echo"));
        assert_eq!(hasher.register("echo").unwrap(), hasher.hash("echo"));
        assert_eq!(hasher.known_topics(), 1);
    }

    #[test]
    fn distinct_topics_get_distinct_hashes() {
        let hasher = TopicHasher::new();
        let topics = ["add", "sub_add", "echo", "log", "a", "b", ""];
        let mut hashes: Vec<_> = topics.iter().map(|t| hasher.hash(t)).collect();
        hashes.sort_unstable();
        hashes.dedup();
        assert_eq!(hashes.len(), topics.len());
        assert!(!hashes.contains(&PUBLISH_HASH));
    }

    #[test]
    fn collisions_are_protocol_errors() {
        let hasher = TopicHasher::new();
        let hash = hasher.hash("real");
        // Forge a second name already bound to the same value.
        hasher
            .seen
            .lock()
            .unwrap()
            .insert(hash, Arc::from("impostor"));
        let err = hasher.register("real").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
