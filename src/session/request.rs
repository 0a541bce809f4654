use crate::error::RequestError;
use crate::tokenizer::TokenId;

pub const DEFAULT_PRIORITY: f32 = 0.5;

/// Optional decoding controls. `None` leaves the engine default in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub temperature: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub min_tokens: Option<u32>,
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.top_k == Some(0) {
            return Err(invalid("top_k must be >= 1"));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(invalid(format!("top_p must be in (0, 1], got {}", p)));
            }
        }
        if let Some(t) = self.temperature {
            if !(t > 0.0 && t.is_finite()) {
                return Err(invalid(format!("temperature must be > 0, got {}", t)));
            }
        }
        if let Some(r) = self.repetition_penalty {
            if !(r > 0.0 && r.is_finite()) {
                return Err(invalid(format!("repetition_penalty must be > 0, got {}", r)));
            }
        }
        for (name, value) in [
            ("presence_penalty", self.presence_penalty),
            ("frequency_penalty", self.frequency_penalty),
            ("length_penalty", self.length_penalty),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(invalid(format!("{} must be finite", name)));
                }
            }
        }
        if self.min_tokens == Some(0) {
            return Err(invalid("min_tokens must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputOptions {
    pub return_log_probs: bool,
    pub exclude_input_from_output: bool,
}

/// Per-request knobs supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub max_new_tokens: u32,
    pub streaming: bool,
    pub num_beams: u32,
    pub sampling: SamplingParams,
    pub output: OutputOptions,
    pub priority: f32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 17,
            streaming: true,
            num_beams: 1,
            sampling: SamplingParams::default(),
            output: OutputOptions::default(),
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl RequestOptions {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.max_new_tokens == 0 {
            return Err(invalid("max_new_tokens must be > 0"));
        }
        if self.num_beams == 0 {
            return Err(invalid("num_beams must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.priority) {
            return Err(invalid(format!("priority must be in [0, 1], got {}", self.priority)));
        }
        self.sampling.validate()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput {
    Text(String),
    TokenIds(Vec<TokenId>),
}

/// A request ready for the engine. It is moved into the engine on admission,
/// so it cannot be submitted twice.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Locally assigned; identifies the request until the engine assigns an id.
    pub correlation_id: u64,
    pub input_token_ids: Vec<TokenId>,
    pub max_new_tokens: u32,
    pub streaming: bool,
    pub num_beams: u32,
    pub sampling: SamplingParams,
    pub output: OutputOptions,
    pub priority: f32,
    pub end_id: TokenId,
}

pub(crate) fn invalid(msg: impl Into<String>) -> RequestError {
    RequestError::Invalid(msg.into())
}
