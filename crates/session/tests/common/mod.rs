#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use parley_llm::{
    LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEvent,
    StreamRequest, StreamTarget, make_event_stream,
};
use parley_session::{ControllerConfig, SessionController, SessionStore};
use parley_storage::{
    ConversationBlob, ConversationStore, MemoryStorage, StorageError, StorageResult, UserId,
};
use tokio::sync::mpsc;

/// How the provider answers the next request.
#[derive(Debug, Clone)]
pub enum Script {
    /// Streams every chunk, then `Done`.
    Reply(Vec<&'static str>),
    /// Streams every chunk, then an error.
    Fail(Vec<&'static str>, &'static str),
    /// Streams every chunk, then closes without a terminal event.
    Truncate(Vec<&'static str>),
    /// Hands the sender to the test through [`ScriptedProvider::take_manual`].
    Manual,
}

pub struct ManualStream {
    pub target: StreamTarget,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

impl ManualStream {
    pub fn delta(&self, text: &str) {
        let _ = self.events.send(StreamEvent::delta(self.target, text));
    }

    pub fn done(&self) {
        let _ = self.events.send(StreamEvent::done(self.target));
    }

    pub fn error(&self, message: &str) {
        let _ = self.events.send(StreamEvent::error(self.target, message));
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    manual: Mutex<VecDeque<ManualStream>>,
}

impl ScriptedProvider {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().expect("scripts lock").push_back(script);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn take_manual(&self) -> ManualStream {
        self.manual
            .lock()
            .expect("manual lock")
            .pop_front()
            .expect("a manual stream was opened")
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let target = request.target;
        self.requests.lock().expect("requests lock").push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or(Script::Reply(vec!["ok"]));

        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        let worker: ProviderWorker = match script {
            Script::Manual => {
                self.manual.lock().expect("manual lock").push_back(ManualStream {
                    target,
                    events: event_tx,
                });
                Box::pin(async move {
                    let _ = cancel_rx.await;
                })
            }
            Script::Reply(chunks) => Box::pin(async move {
                for chunk in chunks {
                    let _ = event_tx.send(StreamEvent::delta(target, chunk));
                }
                let _ = event_tx.send(StreamEvent::done(target));
            }),
            Script::Fail(chunks, message) => Box::pin(async move {
                for chunk in chunks {
                    let _ = event_tx.send(StreamEvent::delta(target, chunk));
                }
                let _ = event_tx.send(StreamEvent::error(target, message));
            }),
            Script::Truncate(chunks) => Box::pin(async move {
                for chunk in chunks {
                    let _ = event_tx.send(StreamEvent::delta(target, chunk));
                }
            }),
        };

        Ok(ProviderStreamHandle { stream, worker })
    }
}

pub fn user(raw: &str) -> UserId {
    UserId::parse(raw).expect("valid user id")
}

pub fn memory_store() -> (Arc<MemoryStorage>, Arc<SessionStore>) {
    let backend = Arc::new(MemoryStorage::new());
    let store = Arc::new(SessionStore::new(backend.clone()));
    (backend, store)
}

/// Backend whose every call fails, as an unreachable database would.
#[derive(Default)]
pub struct FailingStorage {
    pub calls: Mutex<usize>,
}

impl FailingStorage {
    fn fail<T>(&self, stage: &'static str) -> StorageResult<T> {
        *self.calls.lock().expect("calls lock") += 1;
        Err(StorageError::InvariantViolation {
            stage,
            details: "backend offline".to_string(),
        })
    }
}

impl ConversationStore for FailingStorage {
    fn load_conversation(&self, _user_id: &UserId) -> StorageResult<Option<ConversationBlob>> {
        self.fail("failing-load")
    }

    fn save_conversation(
        &self,
        _user_id: &UserId,
        _payload: &str,
    ) -> StorageResult<ConversationBlob> {
        self.fail("failing-save")
    }

    fn clear_conversation(&self, _user_id: &UserId) -> StorageResult<()> {
        self.fail("failing-clear")
    }
}

pub fn failing_store() -> (Arc<FailingStorage>, Arc<SessionStore>) {
    let backend = Arc::new(FailingStorage::default());
    let store = Arc::new(SessionStore::new(backend.clone()));
    (backend, store)
}

pub fn controller(
    store: &Arc<SessionStore>,
    provider: &Arc<ScriptedProvider>,
) -> SessionController {
    let provider: Arc<dyn LlmProvider> = provider.clone();
    SessionController::new(ControllerConfig::default(), Arc::clone(store), Some(provider))
}

pub async fn ready_controller(
    store: &Arc<SessionStore>,
    provider: &Arc<ScriptedProvider>,
    user_id: &str,
) -> SessionController {
    let mut controller = controller(store, provider);
    controller
        .initialize(user(user_id))
        .await
        .expect("initialize");
    controller
}

pub fn png(name: &str) -> parley_session::FileHandle {
    parley_session::FileHandle::new(name, Some("image/png".to_string()), vec![0x89, b'P', b'N', b'G'])
}
