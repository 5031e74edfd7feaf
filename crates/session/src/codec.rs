//! Conversions between in-memory history, the persisted blob and provider turns.

use parley_llm::{ProviderHistory, ProviderTurn, TurnPart, TurnRole};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::attachment::Attachment;
use crate::error::{
    CodecSnafu, InvalidHistoryOrderSnafu, SessionResult, UnsupportedPayloadVersionSnafu,
};
use crate::message::{ConversationHistory, Message, MessageId, Sender};

pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedConversation {
    version: u32,
    messages: Vec<PersistedMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMessage {
    id: MessageId,
    sender: Sender,
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<PersistedAttachment>,
    #[serde(default)]
    created_at_unix_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedAttachment {
    file_name: String,
    media_type: String,
    encoded_payload: String,
    #[serde(default)]
    size_bytes: u64,
}

/// Bare message arrays predate the versioned envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PersistedShape {
    Envelope(PersistedConversation),
    Bare(Vec<PersistedMessage>),
}

/// Maps history onto provider turns.
///
/// Streaming placeholders and messages without any content are not sent.
pub fn to_provider_format(history: &[Message]) -> SessionResult<ProviderHistory> {
    if let Some(first) = history.first() {
        ensure!(
            first.is_user(),
            InvalidHistoryOrderSnafu {
                stage: "codec-to-provider-format",
                found: first.sender.as_str(),
            }
        );
    }

    Ok(history
        .iter()
        .filter(|message| !message.streaming)
        .map(to_provider_turn)
        .filter(|turn| !turn.is_empty())
        .collect())
}

pub fn to_provider_turn(message: &Message) -> ProviderTurn {
    let role = match message.sender {
        Sender::User => TurnRole::User,
        Sender::Agent => TurnRole::Assistant,
    };

    let mut parts = Vec::with_capacity(message.attachments.len() + 1);
    if !message.text.trim().is_empty() {
        parts.push(TurnPart::Text(message.text.clone()));
    }
    parts.extend(message.attachments.iter().map(|attachment| TurnPart::Image {
        media_type: attachment.media_type.clone(),
        data: attachment.encoded_payload.to_string(),
    }));

    ProviderTurn::new(role, parts)
}

pub fn to_persisted(history: &[Message]) -> SessionResult<String> {
    let payload = PersistedConversation {
        version: PAYLOAD_VERSION,
        messages: history
            .iter()
            .map(|message| PersistedMessage {
                id: message.id,
                sender: message.sender,
                text: message.text.clone(),
                attachments: message
                    .attachments
                    .iter()
                    .map(|attachment| PersistedAttachment {
                        file_name: attachment.file_name.clone(),
                        media_type: attachment.media_type.clone(),
                        encoded_payload: attachment.encoded_payload.to_string(),
                        size_bytes: attachment.size_bytes,
                    })
                    .collect(),
                created_at_unix_ms: message.created_at_unix_ms,
            })
            .collect(),
    };

    serde_json::to_string(&payload).context(CodecSnafu {
        stage: "codec-serialize-history",
    })
}

/// Restores history from a persisted blob; `streaming` always comes back false.
pub fn from_persisted(raw: &str) -> SessionResult<ConversationHistory> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let shape = serde_json::from_str::<PersistedShape>(raw).context(CodecSnafu {
        stage: "codec-deserialize-history",
    })?;
    let messages = match shape {
        PersistedShape::Envelope(conversation) => {
            ensure!(
                conversation.version == PAYLOAD_VERSION,
                UnsupportedPayloadVersionSnafu {
                    stage: "codec-check-version",
                    version: conversation.version,
                }
            );
            conversation.messages
        }
        PersistedShape::Bare(messages) => messages,
    };

    Ok(messages
        .into_iter()
        .map(|message| Message {
            id: message.id,
            sender: message.sender,
            text: message.text,
            attachments: message
                .attachments
                .into_iter()
                .map(|attachment| {
                    Attachment::new(
                        attachment.file_name,
                        attachment.media_type,
                        attachment.encoded_payload,
                        attachment.size_bytes,
                    )
                })
                .collect(),
            created_at_unix_ms: message.created_at_unix_ms,
            streaming: false,
        })
        .collect())
}
