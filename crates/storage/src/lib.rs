pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::UserId;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::ConversationBlob;

/// Key-value store of conversation blobs namespaced by user identity.
pub trait ConversationStore: Send + Sync {
    /// Returns `None` when nothing was ever saved for the user.
    fn load_conversation(&self, user_id: &UserId) -> StorageResult<Option<ConversationBlob>>;
    fn save_conversation(&self, user_id: &UserId, payload: &str)
    -> StorageResult<ConversationBlob>;
    /// Clearing a user with no stored conversation is not an error.
    fn clear_conversation(&self, user_id: &UserId) -> StorageResult<()>;
}
