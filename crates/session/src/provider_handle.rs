use std::sync::Arc;

use parley_llm::{
    GenerationConfig, LlmProvider, ProviderHistory, ProviderResult, ProviderStreamHandle,
    ProviderTurn, StreamRequest, StreamTarget,
};

/// Live conversation context with the inference provider.
///
/// Owned by exactly one session. Recreated (with a new epoch) whenever the
/// authoritative history changes in a way the provider has not seen.
pub struct ProviderHandle {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    generation: GenerationConfig,
    preamble: Option<String>,
    history: ProviderHistory,
    epoch: u64,
    next_stream_id: u64,
}

impl ProviderHandle {
    pub fn open(
        provider: Arc<dyn LlmProvider>,
        model_id: impl Into<String>,
        generation: GenerationConfig,
        history: ProviderHistory,
        epoch: u64,
    ) -> Self {
        let model_id = model_id.into();
        tracing::debug!(
            provider_id = %provider.id(),
            model_id = %model_id,
            history_turns = history.len(),
            epoch,
            "opened provider handle"
        );

        Self {
            provider,
            model_id,
            generation,
            preamble: None,
            history,
            epoch,
            next_stream_id: 1,
        }
    }

    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble.filter(|preamble| !preamble.trim().is_empty());
        self
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn history(&self) -> &[ProviderTurn] {
        &self.history
    }

    /// Opens a stream for `turn` on top of the handle's history.
    pub fn send(&mut self, turn: ProviderTurn) -> ProviderResult<ProviderStreamHandle> {
        let target = StreamTarget::new(self.epoch, self.next_stream_id);
        self.next_stream_id = self.next_stream_id.saturating_add(1);

        let mut request = StreamRequest::new(target, self.model_id.clone(), self.history.clone(), turn)
            .with_generation(self.generation);
        if let Some(preamble) = &self.preamble {
            request = request.with_preamble(preamble.clone());
        }

        self.provider.stream_chat(request)
    }

    /// Extends the provider-side history after a completed exchange.
    pub fn record_exchange(&mut self, user_turn: ProviderTurn, agent_turn: ProviderTurn) {
        self.history.push(user_turn);
        self.history.push(agent_turn);
    }
}
