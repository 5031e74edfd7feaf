use parley_llm::ProviderError;
use parley_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("inference provider unavailable: {reason}"))]
    ProviderUnavailable {
        stage: &'static str,
        reason: String,
    },
    #[snafu(display("failed to connect inference provider on `{stage}`: {source}"))]
    ProviderConnect {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("history must open with a user turn, found {found} at position 0"))]
    InvalidHistoryOrder {
        stage: &'static str,
        found: &'static str,
    },
    #[snafu(display("stream failed: {message}"))]
    StreamFailure {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("failed to read persisted conversation for '{user_id}'"))]
    PersistenceRead {
        stage: &'static str,
        user_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to write persisted conversation for '{user_id}'"))]
    PersistenceWrite {
        stage: &'static str,
        user_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to encode or decode conversation payload on `{stage}`: {source}"))]
    Codec {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("unsupported conversation payload version {version}"))]
    UnsupportedPayloadVersion { stage: &'static str, version: u32 },
    #[snafu(display("session is not ready (currently {state})"))]
    NotReady {
        stage: &'static str,
        state: &'static str,
    },
    #[snafu(display("session runtime stopped before `{stage}` completed"))]
    RuntimeStopped { stage: &'static str },
    #[snafu(display("invalid user id: {source}"))]
    InvalidUserId {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to read attachment {path}"))]
    ReadAttachment {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;
