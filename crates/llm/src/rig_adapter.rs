use futures::StreamExt;
use rig::OneOrMany;
use rig::completion::message::{ImageMediaType, MimeType, UserContent};
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::DEFAULT_OPENAI_MODEL;
use super::provider::{
    CompletionsFailedSnafu, EmptyTurnSnafu, HttpClientSnafu, LlmProvider, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderResult, ProviderStreamHandle, ProviderTurn,
    ProviderWorker, StreamEvent, StreamRequest, StreamTarget, TurnPart, TurnRole,
    make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(turn: &ProviderTurn) -> Option<RigMessage> {
        if turn.is_empty() {
            return None;
        }

        match turn.role {
            TurnRole::Assistant => Some(RigMessage::assistant(turn.text())),
            TurnRole::User if turn.image_count() == 0 => Some(RigMessage::user(turn.text())),
            TurnRole::User => {
                let content = turn
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        TurnPart::Text(text) if text.trim().is_empty() => None,
                        TurnPart::Text(text) => Some(UserContent::text(text.clone())),
                        TurnPart::Image { media_type, data } => Some(UserContent::image_base64(
                            data.clone(),
                            ImageMediaType::from_mime_type(media_type),
                            None,
                        )),
                    })
                    .collect::<Vec<_>>();

                OneOrMany::many(content)
                    .ok()
                    .map(|content| RigMessage::User { content })
            }
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let history = request
            .history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = Self::to_rig_message(&request.turn) else {
            tracing::warn!(
                target = ?request.target,
                model_id = %request.model_id,
                history_turns = request.history.len(),
                "cannot open stream because the outgoing turn has no content"
            );
            return EmptyTurnSnafu {
                stage: "open-stream-build-prompt",
                target: request.target,
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(history);

        if let Some(preamble) = request
            .preamble
            .as_ref()
            .filter(|preamble| !preamble.trim().is_empty())
        {
            builder = builder.preamble(preamble.clone());
        }

        let generation = request.generation.sanitized();
        if let Some(temperature) = generation.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = generation.max_output_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEvent::error(target, error.to_string()));
    }

    fn map_stream_item<R>(target: StreamTarget, item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEvent::delta(target, text.text))
            }
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEvent::done(target));
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        self.config
            .model_id
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.turn.is_empty(),
            EmptyTurnSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: &str) -> ProviderConfig {
        ProviderConfig::new("openai", api_key, "", None)
    }

    #[test]
    fn adapter_requires_api_key() {
        assert!(matches!(
            RigProviderAdapter::new(config("  ")),
            Err(ProviderError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn default_model_prefers_configured_id() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new(
            "openai",
            "sk-test",
            "",
            Some("gpt-4.1".to_string()),
        ))
        .expect("adapter");
        assert_eq!(adapter.default_model(), "gpt-4.1");

        let adapter = RigProviderAdapter::new(config("sk-test")).expect("adapter");
        assert_eq!(adapter.default_model(), DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn stream_chat_rejects_empty_turn() {
        let adapter = RigProviderAdapter::new(config("sk-test")).expect("adapter");
        let request = StreamRequest::new(
            StreamTarget::new(1, 1),
            DEFAULT_OPENAI_MODEL,
            Vec::new(),
            ProviderTurn::user_text(" "),
        );
        assert!(matches!(
            adapter.stream_chat(request),
            Err(ProviderError::EmptyTurn { .. })
        ));
    }

    #[test]
    fn empty_turns_do_not_become_rig_messages() {
        assert!(RigProviderAdapter::to_rig_message(&ProviderTurn::assistant_text("")).is_none());
        assert!(RigProviderAdapter::to_rig_message(&ProviderTurn::user_text("hi")).is_some());
    }
}
