//! Read-only view of the controller state for whatever front end is attached.

use std::sync::Arc;

use crate::attachment::{self, Attachment};
use crate::controller::{ControllerStatus, SessionController};
use crate::message::{Message, MessageId, Sender};

/// What a message body shows right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Placeholder before the first chunk.
    Pending,
    Partial(String),
    Complete(String),
}

impl MessageBody {
    pub fn text(&self) -> &str {
        match self {
            Self::Pending => "",
            Self::Partial(text) | Self::Complete(text) => text,
        }
    }
}

/// Snapshots are rebuilt on every streamed token, so the payload is shared
/// rather than copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentView {
    pub file_name: String,
    pub media_type: String,
    pub size_bytes: u64,
    /// Live preview while staged or freshly sent; `None` once restored from storage.
    pub preview_id: Option<u64>,
    pub payload: Arc<str>,
}

impl AttachmentView {
    /// Inline `data:` URL for renderers without access to the preview.
    pub fn data_url(&self) -> String {
        attachment::data_url(&self.media_type, &self.payload)
    }
}

impl From<&Attachment> for AttachmentView {
    fn from(attachment: &Attachment) -> Self {
        Self {
            file_name: attachment.file_name.clone(),
            media_type: attachment.media_type.clone(),
            size_bytes: attachment.size_bytes,
            preview_id: attachment.preview_id(),
            payload: Arc::clone(&attachment.encoded_payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub index: usize,
    pub sender: Sender,
    pub body: MessageBody,
    pub attachments: Vec<AttachmentView>,
}

impl MessageView {
    fn from_message(index: usize, message: &Message) -> Self {
        let body = match (message.streaming, message.text.is_empty()) {
            (true, true) => MessageBody::Pending,
            (true, false) => MessageBody::Partial(message.text.clone()),
            (false, _) => MessageBody::Complete(message.text.clone()),
        };

        Self {
            id: message.id,
            index,
            sender: message.sender,
            body,
            attachments: message.attachments.iter().map(AttachmentView::from).collect(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        !matches!(self.body, MessageBody::Complete(_))
    }
}

/// Snapshot published after every controller mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderModel {
    pub user_id: Option<String>,
    pub status: ControllerStatus,
    pub messages: Vec<MessageView>,
    pub is_awaiting_response: bool,
    pub pending_attachments: Vec<AttachmentView>,
}

impl Default for RenderModel {
    fn default() -> Self {
        Self {
            user_id: None,
            status: ControllerStatus::Uninitialized,
            messages: Vec::new(),
            is_awaiting_response: false,
            pending_attachments: Vec::new(),
        }
    }
}

impl RenderModel {
    pub fn from_controller(controller: &SessionController) -> Self {
        Self {
            user_id: controller.user_id().map(ToString::to_string),
            status: controller.status(),
            messages: controller
                .history()
                .iter()
                .enumerate()
                .map(|(index, message)| MessageView::from_message(index, message))
                .collect(),
            is_awaiting_response: controller.is_awaiting_response(),
            pending_attachments: controller
                .pending_attachments()
                .iter()
                .map(AttachmentView::from)
                .collect(),
        }
    }

    pub fn last_message(&self) -> Option<&MessageView> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_bodies_distinguish_pending_from_partial() {
        let mut placeholder = Message::agent_streaming();
        assert_eq!(MessageView::from_message(1, &placeholder).body, MessageBody::Pending);

        placeholder.text = "Hel".to_string();
        let view = MessageView::from_message(1, &placeholder);
        assert_eq!(view.body, MessageBody::Partial("Hel".to_string()));
        assert!(view.is_streaming());

        placeholder.streaming = false;
        let view = MessageView::from_message(1, &placeholder);
        assert_eq!(view.body.text(), "Hel");
        assert!(!view.is_streaming());
    }

    #[test]
    fn attachments_render_from_their_payload() {
        let message = Message::user(
            "",
            vec![Attachment::new("a.png", "image/png", "AAAA", 3)],
        );
        let view = MessageView::from_message(0, &message);

        assert_eq!(view.body, MessageBody::Complete(String::new()));
        assert_eq!(view.attachments[0].preview_id, None);
        assert_eq!(view.attachments[0].data_url(), "data:image/png;base64,AAAA");
    }

    #[test]
    fn views_share_the_attachment_payload() {
        let message = Message::user(
            "",
            vec![Attachment::new("a.png", "image/png", "AAAA", 3)],
        );
        let first = MessageView::from_message(0, &message);
        let second = MessageView::from_message(0, &message);

        assert!(Arc::ptr_eq(
            &first.attachments[0].payload,
            &message.attachments[0].encoded_payload
        ));
        assert!(Arc::ptr_eq(
            &first.attachments[0].payload,
            &second.attachments[0].payload
        ));
    }
}
