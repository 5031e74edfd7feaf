use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::UserId;
use super::types::{ConversationBlob, unix_timestamp_seconds};
use super::ConversationStore;

/// Process-local store, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    conversations: Mutex<HashMap<UserId, ConversationBlob>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.lock("memory-len")?.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(
        &self,
        stage: &'static str,
    ) -> StorageResult<MutexGuard<'_, HashMap<UserId, ConversationBlob>>> {
        match self.conversations.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "memory storage lock poisoned".to_string(),
            }
            .fail(),
        }
    }
}

impl ConversationStore for MemoryStorage {
    fn load_conversation(&self, user_id: &UserId) -> StorageResult<Option<ConversationBlob>> {
        Ok(self.lock("memory-load")?.get(user_id).cloned())
    }

    fn save_conversation(
        &self,
        user_id: &UserId,
        payload: &str,
    ) -> StorageResult<ConversationBlob> {
        let blob = ConversationBlob {
            user_id: user_id.clone(),
            payload: payload.to_string(),
            updated_at_unix_seconds: unix_timestamp_seconds(),
        };
        self.lock("memory-save")?
            .insert(user_id.clone(), blob.clone());
        Ok(blob)
    }

    fn clear_conversation(&self, user_id: &UserId) -> StorageResult<()> {
        self.lock("memory-clear")?.remove(user_id);
        Ok(())
    }
}
