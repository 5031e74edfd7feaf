use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parley_storage::{ConversationStore, UserId};
use snafu::ResultExt;

use crate::codec;
use crate::error::{
    InvalidUserIdSnafu, PersistenceReadSnafu, PersistenceWriteSnafu, SessionResult,
};
use crate::message::{ConversationHistory, Message};

pub fn parse_user_id(raw: &str) -> SessionResult<UserId> {
    UserId::parse(raw).context(InvalidUserIdSnafu {
        stage: "session-parse-user-id",
    })
}

/// Per-user persisted conversation state on top of a blob backend.
///
/// Writes for the same user are serialized; different users never contend.
pub struct SessionStore {
    backend: Arc<dyn ConversationStore>,
    write_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn ConversationStore>) -> Self {
        Self {
            backend,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Loads history, treating read and decode failures as an empty conversation.
    pub fn load(&self, user_id: &UserId) -> ConversationHistory {
        match self.try_load(user_id) {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %error,
                    "failed to restore conversation; starting empty"
                );
                Vec::new()
            }
        }
    }

    pub fn try_load(&self, user_id: &UserId) -> SessionResult<ConversationHistory> {
        let blob = self
            .backend
            .load_conversation(user_id)
            .context(PersistenceReadSnafu {
                stage: "session-store-load",
                user_id: user_id.to_string(),
            })?;

        match blob {
            Some(blob) => codec::from_persisted(&blob.payload),
            None => Ok(Vec::new()),
        }
    }

    pub fn save(&self, user_id: &UserId, history: &[Message]) -> SessionResult<()> {
        let payload = codec::to_persisted(history)?;
        let lock = self.write_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.backend
            .save_conversation(user_id, &payload)
            .context(PersistenceWriteSnafu {
                stage: "session-store-save",
                user_id: user_id.to_string(),
            })?;

        tracing::debug!(
            user_id = %user_id,
            message_count = history.len(),
            "persisted conversation"
        );
        Ok(())
    }

    pub fn clear(&self, user_id: &UserId) -> SessionResult<()> {
        let lock = self.write_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let result = self
            .backend
            .clear_conversation(user_id)
            .context(PersistenceWriteSnafu {
                stage: "session-store-clear",
                user_id: user_id.to_string(),
            });
        self.release_write_lock(user_id, &lock);
        result
    }

    fn write_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(user_id.clone()).or_default())
    }

    /// Drops the user's lock entry unless another writer is holding or waiting on it.
    fn release_write_lock(&self, user_id: &UserId, lock: &Arc<Mutex<()>>) {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if Arc::strong_count(lock) == 2 {
            locks.remove(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::MemoryStorage;

    use super::*;
    use crate::attachment::Attachment;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).expect("valid user id")
    }

    #[test]
    fn clearing_drops_the_user_write_lock() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        let alice = user("alice");
        let bob = user("bob");

        store.save(&alice, &[Message::user("hi", Vec::new())]).expect("save");
        store.save(&bob, &[Message::user("yo", Vec::new())]).expect("save");
        assert_eq!(store.write_locks.lock().expect("locks").len(), 2);

        store.clear(&alice).expect("clear");
        let locks = store.write_locks.lock().expect("locks");
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&bob));
    }

    #[test]
    fn save_then_load_returns_equal_history() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        let alice = user("alice");
        let history = vec![
            Message::user(
                "look",
                vec![Attachment::new("dog.png", "image/png", "ZG9n", 3)],
            ),
            Message::agent("A dog."),
        ];

        store.save(&alice, &history).expect("save");
        assert_eq!(store.load(&alice), history);
        assert!(store.load(&user("bob")).is_empty());
    }

    #[test]
    fn blank_user_ids_are_rejected() {
        assert!(matches!(
            parse_user_id("  "),
            Err(crate::error::SessionError::InvalidUserId { .. })
        ));
        assert_eq!(parse_user_id(" alice ").expect("valid").as_str(), "alice");
    }

    #[test]
    fn malformed_blob_loads_as_empty() {
        let backend = Arc::new(MemoryStorage::new());
        let alice = user("alice");
        backend
            .save_conversation(&alice, "definitely not json")
            .expect("raw save");

        let store = SessionStore::new(backend);
        assert!(store.try_load(&alice).is_err());
        assert!(store.load(&alice).is_empty());
    }

    #[test]
    fn clear_removes_persisted_history() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        let alice = user("alice");
        store
            .save(&alice, &[Message::user("hi", Vec::new())])
            .expect("save");

        store.clear(&alice).expect("clear");
        assert!(store.load(&alice).is_empty());
    }
}
