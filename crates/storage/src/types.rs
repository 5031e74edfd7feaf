use super::ids::UserId;

/// Serialized conversation history for one user, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationBlob {
    pub user_id: UserId,
    pub payload: String,
    pub updated_at_unix_seconds: u64,
}

pub(crate) fn unix_timestamp_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
