use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attachment::Attachment;

/// Stable identifier for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    /// Time-ordered id, so ids sort in creation order.
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw).map(Self)
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

/// One entry of a conversation.
///
/// Content is frozen once `streaming` is false; the only later mutation is deletion.
#[derive(Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub created_at_unix_ms: u64,
    pub streaming: bool,
}

impl Message {
    pub fn new(sender: Sender, text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: MessageId::new_v7(),
            sender,
            text: text.into(),
            attachments,
            created_at_unix_ms: unix_timestamp_millis(),
            streaming: false,
        }
    }

    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self::new(Sender::User, text, attachments)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Sender::Agent, text, Vec::new())
    }

    /// Agent placeholder shown while a response is pending.
    pub fn agent_streaming() -> Self {
        Self {
            streaming: true,
            ..Self::agent(String::new())
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }

    pub fn is_agent(&self) -> bool {
        self.sender == Sender::Agent
    }
}

/// Ordered messages of one user; insertion order is conversational order.
pub type ConversationHistory = Vec<Message>;

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
