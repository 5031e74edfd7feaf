//! Drives one in-flight provider request and folds its token stream into a
//! single accumulated response.

use parley_llm::{ProviderEventStream, ProviderTurn, StreamEventPayload, StreamTarget};
use snafu::ResultExt;
use tokio::task::JoinHandle;

use crate::error::{ProviderConnectSnafu, SessionResult};
use crate::message::MessageId;
use crate::provider_handle::ProviderHandle;

pub const TRUNCATED_STREAM_MESSAGE: &str = "provider stream ended before a terminal event";

/// Lifecycle of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    /// Request sent, no chunk received yet.
    Requesting(StreamTarget),
    Streaming(StreamTarget),
    Completed(StreamTarget),
    Failed {
        target: StreamTarget,
        message: String,
    },
    Cancelled(StreamTarget),
}

/// State transition input for the stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Request(StreamTarget),
    FirstChunk(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyActive {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamPhase, StreamTransitionRejection>;

impl StreamPhase {
    /// Returns the target while requesting or streaming.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Requesting(target) | Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_target().is_some()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_)
        )
    }

    /// Returns true when incoming stream data matches the active stream.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    /// Applies one transition deterministically.
    ///
    /// Only `Idle` or a terminal phase may start a new request. Every other
    /// transition must name the active target exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Request(target) => self.apply_request(target),
            StreamTransition::FirstChunk(target) => self.apply_first_chunk(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, Self::Completed(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, Self::Failed { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, Self::Cancelled(target))
            }
        }
    }

    fn apply_request(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) => Err(StreamTransitionRejection::AlreadyActive {
                active,
                attempted: target,
            }),
            None => Ok(Self::Requesting(target)),
        }
    }

    fn apply_first_chunk(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Requesting(active) | Self::Streaming(active) if *active == target => {
                Ok(Self::Streaming(target))
            }
            Self::Requesting(active) | Self::Streaming(active) => {
                Err(StreamTransitionRejection::TargetMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }

    fn apply_terminal(&self, target: StreamTarget, next: Self) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) if active == target => Ok(next),
            Some(active) => Err(StreamTransitionRejection::TargetMismatch {
                active,
                attempted: target,
            }),
            None => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

/// Per-turn accumulation, alive from submission until the stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingState {
    pub target_message_id: MessageId,
    pub accumulated_text: String,
    pub phase: StreamPhase,
}

impl StreamingState {
    pub fn new(target_message_id: MessageId) -> Self {
        Self {
            target_message_id,
            accumulated_text: String::new(),
            phase: StreamPhase::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.phase, StreamPhase::Cancelled(_))
    }

    /// True until the first chunk arrives.
    pub fn is_pending(&self) -> bool {
        matches!(self.phase, StreamPhase::Requesting(_))
    }

    fn transition(&mut self, transition: StreamTransition) -> bool {
        match self.phase.apply(transition) {
            Ok(next) => {
                self.phase = next;
                true
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "rejected stream transition");
                false
            }
        }
    }

    /// Appends a chunk if, and only if, the stream is still live for `target`.
    pub fn apply_chunk(&mut self, target: StreamTarget, chunk: &str) -> bool {
        if !self.phase.accepts_stream_event(target) {
            return false;
        }

        if !self.transition(StreamTransition::FirstChunk(target)) {
            return false;
        }
        self.accumulated_text.push_str(chunk);
        true
    }
}

/// Observable progress of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorUpdate {
    Token(String),
    Completed(String),
    Failed(String),
    /// Carries whatever text arrived before cancellation.
    Cancelled(String),
}

pub struct StreamAggregator {
    state: StreamingState,
    target: StreamTarget,
    outgoing_turn: ProviderTurn,
    events: ProviderEventStream,
    // Detached on drop; the worker exits once it observes the cancel signal.
    _worker: JoinHandle<()>,
    finished: bool,
}

impl StreamAggregator {
    /// Sends `turn` through the handle and spawns the provider worker.
    pub fn start(
        handle: &mut ProviderHandle,
        target_message_id: MessageId,
        turn: ProviderTurn,
    ) -> SessionResult<Self> {
        let stream_handle = handle.send(turn.clone()).context(ProviderConnectSnafu {
            stage: "aggregator-start",
        })?;
        let events = stream_handle.stream;
        let target = events.target();
        let worker = tokio::spawn(stream_handle.worker);

        let mut state = StreamingState::new(target_message_id);
        state.transition(StreamTransition::Request(target));

        tracing::debug!(
            target = ?target,
            message_id = %target_message_id,
            "stream requested"
        );

        Ok(Self {
            state,
            target,
            outgoing_turn: turn,
            events,
            _worker: worker,
            finished: false,
        })
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    pub fn outgoing_turn(&self) -> &ProviderTurn {
        &self.outgoing_turn
    }

    /// Stops applying results. Idempotent; returns true only on the first call.
    pub fn cancel(&mut self) -> bool {
        if !self.state.transition(StreamTransition::Cancel(self.target)) {
            return false;
        }

        self.events.cancel();
        tracing::debug!(target = ?self.target, "stream cancelled");
        true
    }

    /// Waits for the next update. Returns `None` once a terminal update was reported.
    ///
    /// Cancel-safe: dropping the future never loses a chunk.
    pub async fn next_update(&mut self) -> Option<AggregatorUpdate> {
        if self.finished {
            return None;
        }

        if self.state.cancelled() {
            self.finished = true;
            return Some(AggregatorUpdate::Cancelled(
                self.state.accumulated_text.clone(),
            ));
        }

        loop {
            let Some(event) = self.events.recv().await else {
                return Some(self.finish_failed(TRUNCATED_STREAM_MESSAGE.to_string()));
            };

            if event.target != self.target {
                tracing::debug!(
                    active = ?self.target,
                    attempted = ?event.target,
                    "discarding stale stream event"
                );
                continue;
            }

            match event.payload {
                StreamEventPayload::Delta(chunk) => {
                    if chunk.is_empty() || !self.state.apply_chunk(self.target, &chunk) {
                        continue;
                    }
                    return Some(AggregatorUpdate::Token(chunk));
                }
                StreamEventPayload::Done => {
                    self.state.transition(StreamTransition::Complete(self.target));
                    self.finished = true;
                    return Some(AggregatorUpdate::Completed(
                        self.state.accumulated_text.clone(),
                    ));
                }
                StreamEventPayload::Error(message) => {
                    return Some(self.finish_failed(message));
                }
            }
        }
    }

    fn finish_failed(&mut self, message: String) -> AggregatorUpdate {
        self.state.transition(StreamTransition::Fail {
            target: self.target,
            message: message.clone(),
        });
        self.finished = true;
        tracing::warn!(target = ?self.target, error = %message, "stream failed");
        AggregatorUpdate::Failed(message)
    }
}
