use std::fmt::Write as _;

use parley_session::{MessageBody, MessageId, MessageView, RenderModel, Sender};

/// Full transcript with message numbers, as printed by `/show`.
pub fn transcript(model: &RenderModel) -> String {
    let mut out = String::new();
    let user = model.user_id.as_deref().unwrap_or("-");
    let _ = writeln!(out, "--- {user}: {} messages ---", model.messages.len());

    for message in &model.messages {
        let _ = writeln!(out, "[{}] {}", message.index, line(message));
    }

    for (index, attachment) in model.pending_attachments.iter().enumerate() {
        let _ = writeln!(
            out,
            "staged ({index}): {} {} bytes",
            attachment.file_name, attachment.size_bytes
        );
    }
    out
}

fn line(message: &MessageView) -> String {
    let speaker = label(message.sender);
    let mut text = match &message.body {
        MessageBody::Pending => "...".to_string(),
        MessageBody::Partial(text) => format!("{text}..."),
        MessageBody::Complete(text) => text.clone(),
    };
    if !message.attachments.is_empty() {
        let names = message
            .attachments
            .iter()
            .map(|attachment| attachment.file_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(text, " [images: {names}]");
    }
    format!("{speaker}> {text}")
}

fn label(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "you",
        Sender::Agent => "agent",
    }
}

#[derive(Debug, Clone)]
struct Printed {
    id: MessageId,
    text: String,
    complete: bool,
}

/// Turns successive snapshots into incremental terminal output.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    printed: Vec<Printed>,
    drawn: bool,
}

impl StreamPrinter {
    /// Text to append to the terminal for `model`.
    pub fn update(&mut self, model: &RenderModel) -> String {
        let is_continuation = self.drawn
            && self.printed.len() <= model.messages.len()
            && self
                .printed
                .iter()
                .zip(&model.messages)
                .all(|(printed, message)| printed.id == message.id);

        if !is_continuation {
            self.drawn = true;
            self.printed = model.messages.iter().map(snapshot).collect();
            return transcript(model);
        }

        let mut out = String::new();
        for (index, message) in model.messages.iter().enumerate() {
            match self.printed.get_mut(index) {
                Some(printed) => advance(&mut out, printed, message),
                None => {
                    let mut printed = Printed {
                        id: message.id,
                        text: String::new(),
                        complete: false,
                    };
                    if message.sender == Sender::User {
                        printed.text = message.body.text().to_string();
                        printed.complete = true;
                    } else {
                        out.push_str("agent> ");
                        advance(&mut out, &mut printed, message);
                    }
                    self.printed.push(printed);
                }
            }
        }
        out
    }
}

fn advance(out: &mut String, printed: &mut Printed, message: &MessageView) {
    if printed.complete {
        return;
    }

    let text = message.body.text();
    match text.strip_prefix(printed.text.as_str()) {
        Some(suffix) => out.push_str(suffix),
        None => {
            out.push('\n');
            out.push_str(text);
        }
    }
    printed.text = text.to_string();

    if matches!(message.body, MessageBody::Complete(_)) {
        printed.complete = true;
        out.push('\n');
    }
}

fn snapshot(message: &MessageView) -> Printed {
    Printed {
        id: message.id,
        text: message.body.text().to_string(),
        complete: matches!(message.body, MessageBody::Complete(_)),
    }
}

#[cfg(test)]
mod tests {
    use parley_session::ControllerStatus;

    use super::*;

    fn view(index: usize, id: MessageId, sender: Sender, body: MessageBody) -> MessageView {
        MessageView {
            id,
            index,
            sender,
            body,
            attachments: Vec::new(),
        }
    }

    fn model(messages: Vec<MessageView>) -> RenderModel {
        RenderModel {
            user_id: Some("alice".to_string()),
            status: ControllerStatus::Ready,
            is_awaiting_response: messages.iter().any(MessageView::is_streaming),
            messages,
            pending_attachments: Vec::new(),
        }
    }

    #[test]
    fn streamed_tokens_print_incrementally() {
        let user_id = MessageId::new_v7();
        let agent_id = MessageId::new_v7();
        let prompt = || view(0, user_id, Sender::User, MessageBody::Complete("hi".to_string()));
        let mut printer = StreamPrinter::default();

        assert_eq!(
            printer.update(&model(vec![
                prompt(),
                view(1, agent_id, Sender::Agent, MessageBody::Pending),
            ])),
            "--- alice: 2 messages ---\n[0] you> hi\n[1] agent> ...\n"
        );
        assert_eq!(
            printer.update(&model(vec![
                prompt(),
                view(1, agent_id, Sender::Agent, MessageBody::Partial("Hel".to_string())),
            ])),
            "Hel"
        );
        assert_eq!(
            printer.update(&model(vec![
                prompt(),
                view(1, agent_id, Sender::Agent, MessageBody::Complete("Hello".to_string())),
            ])),
            "lo\n"
        );
    }

    #[test]
    fn new_turns_after_start_get_an_agent_prefix() {
        let mut printer = StreamPrinter::default();
        printer.update(&model(Vec::new()));

        let out = printer.update(&model(vec![
            view(0, MessageId::new_v7(), Sender::User, MessageBody::Complete("hi".to_string())),
            view(1, MessageId::new_v7(), Sender::Agent, MessageBody::Partial("Hey".to_string())),
        ]));
        assert_eq!(out, "agent> Hey");
    }

    #[test]
    fn removed_messages_trigger_a_redraw() {
        let kept = MessageId::new_v7();
        let mut printer = StreamPrinter::default();
        printer.update(&model(vec![
            view(0, MessageId::new_v7(), Sender::User, MessageBody::Complete("a".to_string())),
            view(1, kept, Sender::User, MessageBody::Complete("b".to_string())),
        ]));

        let out = printer.update(&model(vec![view(
            0,
            kept,
            Sender::User,
            MessageBody::Complete("b".to_string()),
        )]));
        assert_eq!(out, "--- alice: 1 messages ---\n[0] you> b\n");
    }
}
