//! Streaming conversational sessions: per-user history, attachment staging,
//! token aggregation and persistence around a pluggable inference provider.

pub mod aggregator;
pub mod attachment;
pub mod codec;
pub mod controller;
pub mod error;
pub mod message;
pub mod presenter;
pub mod provider_handle;
pub mod runtime;
pub mod settings;
pub mod store;

pub use aggregator::{
    AggregatorUpdate, StreamAggregator, StreamPhase, StreamTransition, StreamTransitionRejection,
    StreamingState, TRUNCATED_STREAM_MESSAGE,
};
pub use attachment::{
    Attachment, AttachmentEncoder, AttachmentLimits, FileHandle, PendingAttachments,
    PreviewHandle, PreviewRegistry,
};
pub use controller::{
    CANCELLED_NOTICE, ControllerConfig, ControllerStatus, EMPTY_RESPONSE_NOTICE,
    ERROR_SUMMARY_PREFIX, Session, SessionController, SubmitOutcome, SubmitRejection, TurnEvent,
};
pub use error::{SessionError, SessionResult};
pub use message::{ConversationHistory, Message, MessageId, Sender};
pub use presenter::{AttachmentView, MessageBody, MessageView, RenderModel};
pub use provider_handle::ProviderHandle;
pub use runtime::SessionClient;
pub use settings::{ParleySettings, SettingsError, SettingsStore};
pub use store::{SessionStore, parse_user_id};
