//! The boundary to the batched generation engine.
//!
//! The engine schedules and executes requests on its own; the session only
//! enqueues work, reads the admission signal, and collects responses.

mod loopback;

use std::path::Path;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::session::GenerationRequest;
use crate::tokenizer::TokenId;

pub use loopback::{LoopbackEngine, LoopbackLauncher};
pub use session_protocol::FinishReason;

/// Engine-assigned request identifier, unique for the lifetime of a session.
pub type RequestId = u64;

/// Output carried by one response event.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    /// Tokens produced since the previous event, per beam.
    pub output_token_ids: Vec<Vec<TokenId>>,
    /// Log-probabilities for those tokens, per beam, if the request asked.
    pub log_probs: Option<Vec<Vec<f32>>>,
    pub finish_reasons: Vec<FinishReason>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Output(EngineOutput),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: RequestId,
    pub body: ResponseBody,
}

pub trait GenerationEngine {
    /// Backpressure signal: whether another request would be accepted right now.
    fn can_enqueue(&self) -> bool;

    fn enqueue(&mut self, request: GenerationRequest) -> Result<RequestId, EngineError>;

    /// Waits at most `timeout` for response events. Returns as soon as any are
    /// available, or an empty list once the timeout elapses.
    fn await_responses(&mut self, timeout: Duration) -> Vec<Response>;

    fn shutdown(&mut self);
}

impl<E: GenerationEngine + ?Sized> GenerationEngine for Box<E> {
    fn can_enqueue(&self) -> bool {
        (**self).can_enqueue()
    }

    fn enqueue(&mut self, request: GenerationRequest) -> Result<RequestId, EngineError> {
        (**self).enqueue(request)
    }

    fn await_responses(&mut self, timeout: Duration) -> Vec<Response> {
        (**self).await_responses(timeout)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Builds the engine handle once, from a fully validated configuration.
pub trait EngineLauncher {
    fn launch(
        &self,
        engine_dir: &Path,
        config: &EngineConfig,
        end_id: TokenId,
    ) -> Result<Box<dyn GenerationEngine>, EngineError>;
}
