//! Session state machine: initialization, turn submission, stream completion,
//! cancellation and deletion, with persistence after every mutation.

use std::ops::Range;
use std::sync::Arc;

use parley_llm::{GenerationConfig, LlmProvider, ProviderHistory, ProviderTurn};
use parley_storage::UserId;

use crate::aggregator::{AggregatorUpdate, StreamAggregator, StreamingState, TRUNCATED_STREAM_MESSAGE};
use crate::attachment::{
    Attachment, AttachmentEncoder, AttachmentLimits, FileHandle, PendingAttachments,
    PreviewRegistry,
};
use crate::codec;
use crate::error::{
    NotReadySnafu, ProviderUnavailableSnafu, SessionError, SessionResult, StreamFailureSnafu,
};
use crate::message::{ConversationHistory, Message, MessageId};
use crate::provider_handle::ProviderHandle;
use crate::store::SessionStore;

pub const ERROR_SUMMARY_PREFIX: &str = "Something went wrong: ";
pub const CANCELLED_NOTICE: &str = "(response cancelled)";
pub const EMPTY_RESPONSE_NOTICE: &str = "(no response)";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerConfig {
    /// Overrides the provider's default model.
    pub model_id: Option<String>,
    pub generation: GenerationConfig,
    pub preamble: Option<String>,
    pub attachment_limits: AttachmentLimits,
}

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerStatus {
    Uninitialized,
    Initializing,
    Ready,
    Submitting,
    Reinitializing,
}

impl ControllerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Submitting => "submitting",
            Self::Reinitializing => "reinitializing",
        }
    }
}

/// Why a submission did not start a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    Empty,
    NotReady,
    /// A turn is already streaming.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted {
        user_message_id: MessageId,
        agent_message_id: MessageId,
    },
    Ignored(SubmitRejection),
}

/// What one step of an in-flight turn changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    Token,
    Completed,
    Failed(String),
    Cancelled,
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token)
    }
}

struct ActiveTurn {
    aggregator: StreamAggregator,
    agent_message_id: MessageId,
}

enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    Submitting(ActiveTurn),
    Reinitializing,
}

impl Phase {
    fn status(&self) -> ControllerStatus {
        match self {
            Self::Uninitialized => ControllerStatus::Uninitialized,
            Self::Initializing => ControllerStatus::Initializing,
            Self::Ready => ControllerStatus::Ready,
            Self::Submitting(_) => ControllerStatus::Submitting,
            Self::Reinitializing => ControllerStatus::Reinitializing,
        }
    }
}

/// One user's live conversation.
pub struct Session {
    user_id: UserId,
    history: ConversationHistory,
    provider_handle: ProviderHandle,
}

impl Session {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn provider_handle(&self) -> &ProviderHandle {
        &self.provider_handle
    }

    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.history.iter_mut().find(|message| message.id == id)
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.history.iter().position(|message| message.id == id)
    }
}

pub struct SessionController {
    config: ControllerConfig,
    store: Arc<SessionStore>,
    provider: Option<Arc<dyn LlmProvider>>,
    previews: Arc<PreviewRegistry>,
    pending: PendingAttachments,
    session: Option<Session>,
    phase: Phase,
    next_handle_epoch: u64,
}

impl SessionController {
    /// `provider` is `None` when no credentials are configured.
    pub fn new(
        config: ControllerConfig,
        store: Arc<SessionStore>,
        provider: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let previews = PreviewRegistry::new();
        let encoder = AttachmentEncoder::new(config.attachment_limits, Arc::clone(&previews));

        Self {
            config,
            store,
            provider,
            previews,
            pending: PendingAttachments::new(encoder),
            session: None,
            phase: Phase::Uninitialized,
            next_handle_epoch: 1,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.phase.status()
    }

    pub fn is_awaiting_response(&self) -> bool {
        matches!(self.phase, Phase::Submitting(_))
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.session.as_ref().map(Session::user_id)
    }

    pub fn history(&self) -> &[Message] {
        self.session
            .as_ref()
            .map(Session::history)
            .unwrap_or_default()
    }

    pub fn pending_attachments(&self) -> &[Attachment] {
        self.pending.as_slice()
    }

    pub fn streaming_state(&self) -> Option<&StreamingState> {
        match &self.phase {
            Phase::Submitting(turn) => Some(turn.aggregator.state()),
            _ => None,
        }
    }

    pub fn previews(&self) -> &Arc<PreviewRegistry> {
        &self.previews
    }

    /// Loads persisted history for `user_id` and opens a provider handle.
    pub async fn initialize(&mut self, user_id: UserId) -> SessionResult<()> {
        if !matches!(self.phase, Phase::Uninitialized | Phase::Reinitializing) {
            return NotReadySnafu {
                stage: "controller-initialize",
                state: self.status().as_str(),
            }
            .fail();
        }

        let Some(provider) = self.provider.clone() else {
            self.phase = Phase::Uninitialized;
            tracing::error!(user_id = %user_id, "no inference provider configured");
            return ProviderUnavailableSnafu {
                stage: "controller-initialize",
                reason: "no credentials configured for the inference provider".to_string(),
            }
            .fail();
        };

        self.phase = Phase::Initializing;

        let store = Arc::clone(&self.store);
        let load_user = user_id.clone();
        let mut history = match tokio::task::spawn_blocking(move || store.load(&load_user)).await
        {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %error,
                    "conversation load task failed; starting empty"
                );
                Vec::new()
            }
        };

        let provider_history = self.provider_history_or_reset(&user_id, &mut history);
        let provider_handle = self.open_handle(provider, provider_history);

        tracing::info!(
            user_id = %user_id,
            message_count = history.len(),
            epoch = provider_handle.epoch(),
            "session initialized"
        );

        self.session = Some(Session {
            user_id,
            history,
            provider_handle,
        });
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Tears down the current session and initializes `user_id` in its place.
    pub async fn reinitialize(&mut self, user_id: UserId) -> SessionResult<()> {
        if self.session.is_some() {
            self.teardown();
        }

        self.phase = Phase::Reinitializing;
        tracing::info!(user_id = %user_id, "reinitializing session");
        self.initialize(user_id).await
    }

    /// Appends the user turn and a streaming placeholder, persists, then starts
    /// streaming the response.
    pub fn submit_turn(&mut self, text: &str) -> SubmitOutcome {
        match self.phase {
            Phase::Ready => {}
            Phase::Submitting(_) => {
                tracing::warn!("rejecting submission while a response is streaming");
                return SubmitOutcome::Ignored(SubmitRejection::Busy);
            }
            _ => return SubmitOutcome::Ignored(SubmitRejection::NotReady),
        }

        let text = text.trim();
        if text.is_empty() && self.pending.is_empty() {
            return SubmitOutcome::Ignored(SubmitRejection::Empty);
        }

        let Some(session) = self.session.as_mut() else {
            return SubmitOutcome::Ignored(SubmitRejection::NotReady);
        };

        let user_message = Message::user(text, self.pending.take());
        let outgoing_turn = codec::to_provider_turn(&user_message);
        let placeholder = Message::agent_streaming();
        let user_message_id = user_message.id;
        let agent_message_id = placeholder.id;

        session.history.push(user_message);
        session.history.push(placeholder);
        self.persist();

        let Some(session) = self.session.as_mut() else {
            return SubmitOutcome::Ignored(SubmitRejection::NotReady);
        };
        match StreamAggregator::start(
            &mut session.provider_handle,
            agent_message_id,
            outgoing_turn,
        ) {
            Ok(aggregator) => {
                self.phase = Phase::Submitting(ActiveTurn {
                    aggregator,
                    agent_message_id,
                });
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to start response stream");
                self.replace_with_error(agent_message_id, &error.to_string());
            }
        }

        SubmitOutcome::Submitted {
            user_message_id,
            agent_message_id,
        }
    }

    /// Waits for and applies the next stream update. `None` when no turn is active.
    pub async fn next_turn_event(&mut self) -> Option<TurnEvent> {
        let update = match &mut self.phase {
            Phase::Submitting(turn) => turn.aggregator.next_update().await,
            _ => return None,
        };

        Some(match update {
            Some(AggregatorUpdate::Token(chunk)) => {
                self.append_partial_text(&chunk);
                TurnEvent::Token
            }
            Some(AggregatorUpdate::Completed(text)) => {
                self.complete_turn(text);
                TurnEvent::Completed
            }
            Some(AggregatorUpdate::Failed(message)) => {
                self.fail_turn(&message);
                TurnEvent::Failed(message)
            }
            Some(AggregatorUpdate::Cancelled(_)) => {
                self.cancel_turn();
                TurnEvent::Cancelled
            }
            None => {
                self.fail_turn(TRUNCATED_STREAM_MESSAGE);
                TurnEvent::Failed(TRUNCATED_STREAM_MESSAGE.to_string())
            }
        })
    }

    /// Drives the active turn to its end and returns the terminal event.
    pub async fn finish_turn(&mut self) -> Option<TurnEvent> {
        loop {
            let event = self.next_turn_event().await?;
            if event.is_terminal() {
                return Some(event);
            }
        }
    }

    /// Stops the active stream, keeping whatever text already arrived.
    pub fn cancel_turn(&mut self) -> bool {
        let Some(mut turn) = self.take_active_turn() else {
            return false;
        };

        turn.aggregator.cancel();
        let partial = turn.aggregator.state().accumulated_text.clone();

        if let Some(message) = self
            .session
            .as_mut()
            .and_then(|session| session.message_mut(turn.agent_message_id))
        {
            message.text = if partial.is_empty() {
                CANCELLED_NOTICE.to_string()
            } else {
                partial
            };
            message.streaming = false;
        }

        tracing::info!(message_id = %turn.agent_message_id, "response cancelled");
        self.persist();
        self.reset_provider_handle();
        true
    }

    /// Deletes by adjacency: a user turn with its reply, an agent turn with its
    /// prompt, otherwise the single message. Returns how many were removed.
    pub fn delete_message_pair(&mut self, index: usize) -> usize {
        if self.is_awaiting_response() {
            self.cancel_turn();
        }

        if !matches!(self.phase, Phase::Ready) {
            return 0;
        }

        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        let Some(range) = deletion_range(&session.history, index) else {
            tracing::debug!(index, len = session.history.len(), "delete index out of range");
            return 0;
        };

        let removed = session.history.drain(range).count();
        tracing::info!(index, removed, "deleted messages");
        self.persist();
        self.reset_provider_handle();
        removed
    }

    /// Empties the history and the persisted entry. Irreversible.
    pub fn clear_history(&mut self) {
        if self.is_awaiting_response() {
            self.cancel_turn();
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.history.clear();

        if let Err(error) = self.store.clear(&session.user_id) {
            tracing::warn!(user_id = %session.user_id, error = %error, "failed to clear stored conversation");
        }
        tracing::info!(user_id = %session.user_id, "history cleared");
        self.reset_provider_handle();
    }

    /// Stages image files for the next turn; returns how many were accepted.
    pub fn add_attachments(&mut self, files: Vec<FileHandle>) -> usize {
        self.pending.add(files)
    }

    pub fn remove_attachment(&mut self, index: usize) -> bool {
        self.pending.remove(index)
    }

    /// Persists best-effort, then releases the provider handle and previews.
    pub fn teardown(&mut self) {
        if self.is_awaiting_response() {
            self.cancel_turn();
        } else {
            self.persist();
        }

        self.pending.clear();
        if let Some(session) = self.session.take() {
            tracing::info!(user_id = %session.user_id, "session torn down");
        }
        self.phase = Phase::Uninitialized;
    }

    /// Moves the phase back to Ready, handing out the turn that was streaming.
    fn take_active_turn(&mut self) -> Option<ActiveTurn> {
        if !matches!(self.phase, Phase::Submitting(_)) {
            return None;
        }

        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Submitting(turn) => Some(turn),
            _ => None,
        }
    }

    fn append_partial_text(&mut self, chunk: &str) {
        let Phase::Submitting(turn) = &self.phase else {
            return;
        };
        let id = turn.agent_message_id;

        if let Some(message) = self
            .session
            .as_mut()
            .and_then(|session| session.message_mut(id))
        {
            message.text.push_str(chunk);
        }
    }

    fn complete_turn(&mut self, text: String) {
        let Some(turn) = self.take_active_turn() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let text = if text.trim().is_empty() {
            EMPTY_RESPONSE_NOTICE.to_string()
        } else {
            text
        };

        if let Some(message) = session.message_mut(turn.agent_message_id) {
            message.text = text.clone();
            message.streaming = false;
        }
        session.provider_handle.record_exchange(
            turn.aggregator.outgoing_turn().clone(),
            ProviderTurn::assistant_text(text),
        );

        tracing::info!(message_id = %turn.agent_message_id, "response completed");
        self.persist();
    }

    fn fail_turn(&mut self, message: &str) {
        let Some(turn) = self.take_active_turn() else {
            return;
        };
        self.replace_with_error(turn.agent_message_id, message);
    }

    /// Swaps the pending agent message for a terminal error message.
    fn replace_with_error(&mut self, agent_message_id: MessageId, reason: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let error_message = Message::agent(format!("{ERROR_SUMMARY_PREFIX}{reason}"));
        match session.position(agent_message_id) {
            Some(position) => {
                session.history.remove(position);
                session.history.insert(position, error_message);
            }
            None => session.history.push(error_message),
        }

        let failure = StreamFailureSnafu {
            stage: "controller-replace-with-error",
            message: reason,
        }
        .build();
        tracing::warn!(error = %failure, "response failed");
        self.persist();
        self.reset_provider_handle();
    }

    fn persist(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        if let Err(error) = self.store.save(&session.user_id, &session.history) {
            tracing::warn!(
                user_id = %session.user_id,
                error = %error,
                "failed to persist conversation; keeping in-memory state"
            );
        }
    }

    /// Recreates the provider handle from the authoritative history.
    fn reset_provider_handle(&mut self) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        let Some(mut session) = self.session.take() else {
            return;
        };

        let provider_history = self.provider_history_or_reset(&session.user_id, &mut session.history);
        session.provider_handle = self.open_handle(provider, provider_history);
        self.session = Some(session);
    }

    fn provider_history_or_reset(
        &mut self,
        user_id: &UserId,
        history: &mut ConversationHistory,
    ) -> ProviderHistory {
        match codec::to_provider_format(history) {
            Ok(provider_history) => provider_history,
            Err(error @ SessionError::InvalidHistoryOrder { .. }) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %error,
                    "history has an invalid turn order; resetting to empty"
                );
                history.clear();
                if let Err(error) = self.store.clear(user_id) {
                    tracing::warn!(user_id = %user_id, error = %error, "failed to clear stored conversation");
                }
                Vec::new()
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "failed to convert history; resetting");
                history.clear();
                Vec::new()
            }
        }
    }

    fn open_handle(
        &mut self,
        provider: Arc<dyn LlmProvider>,
        provider_history: ProviderHistory,
    ) -> ProviderHandle {
        let epoch = self.next_handle_epoch;
        self.next_handle_epoch = self.next_handle_epoch.saturating_add(1);

        let model_id = self
            .config
            .model_id
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());

        ProviderHandle::open(
            provider,
            model_id,
            self.config.generation,
            provider_history,
            epoch,
        )
        .with_preamble(self.config.preamble.clone())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.teardown();
        }
    }
}

/// Range removed by [`SessionController::delete_message_pair`] for `index`.
pub fn deletion_range(history: &[Message], index: usize) -> Option<Range<usize>> {
    let message = history.get(index)?;

    if message.is_user() && history.get(index + 1).is_some_and(Message::is_agent) {
        return Some(index..index + 2);
    }

    if message.is_agent() && index > 0 && history[index - 1].is_user() {
        return Some(index - 1..index + 1);
    }

    Some(index..index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(pattern: &str) -> ConversationHistory {
        pattern
            .chars()
            .map(|sender| match sender {
                'U' => Message::user("u", Vec::new()),
                _ => Message::agent("a"),
            })
            .collect()
    }

    #[test]
    fn user_turn_takes_its_reply() {
        assert_eq!(deletion_range(&history("UAU"), 0), Some(0..2));
    }

    #[test]
    fn agent_turn_takes_its_prompt() {
        assert_eq!(deletion_range(&history("UA"), 1), Some(0..2));
        assert_eq!(deletion_range(&history("UAUA"), 3), Some(2..4));
    }

    #[test]
    fn broken_adjacency_removes_single_message() {
        assert_eq!(deletion_range(&history("U"), 0), Some(0..1));
        assert_eq!(deletion_range(&history("UAU"), 2), Some(2..3));
        assert_eq!(deletion_range(&history("AA"), 1), Some(1..2));
        assert_eq!(deletion_range(&history("UU"), 0), Some(0..1));
    }

    #[test]
    fn out_of_range_index_removes_nothing() {
        assert_eq!(deletion_range(&history("UA"), 2), None);
        assert_eq!(deletion_range(&[], 0), None);
    }
}
