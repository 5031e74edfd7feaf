use serde::{Deserialize, Serialize};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Sampling options forwarded with every stream request.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Caps the total generated length of one response.
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    /// Controls sampling randomness.
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl GenerationConfig {
    pub fn with_max_output_tokens(mut self, max_output_tokens: u64) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Drops values the provider would reject instead of failing the request.
    pub fn sanitized(self) -> Self {
        Self {
            max_output_tokens: self.max_output_tokens.filter(|tokens| *tokens > 0),
            temperature: self
                .temperature
                .filter(|temperature| temperature.is_finite() && *temperature >= 0.0),
        }
    }
}
