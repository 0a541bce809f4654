//! The inference session: one engine, one tokenizer, and the bookkeeping that
//! turns submitted prompts into decoded results.

mod aggregator;
mod batch;
mod lifecycle;
mod request;
mod serve;

use std::path::{Path, PathBuf};

use crate::config::{load_engine_config, EngineConfig};
use crate::engine::{EngineLauncher, GenerationEngine, RequestId};
use crate::error::Result;
use crate::settings::SessionSettings;
use crate::tokenizer::TokenizerSession;

pub use aggregator::{GenerationResult, MergeOutcome, RequestAccumulator, ResponseAggregator};
pub use batch::{default_batch, BatchPhase};
pub use lifecycle::{RequestLifecycle, RequestTicket, SubmitOutcome};
pub use request::{
    GenerationRequest, OutputOptions, PromptInput, RequestOptions, SamplingParams, DEFAULT_PRIORITY,
};
pub use serve::{ServeEvent, ServeLoop, Ticket};

pub struct InferenceSession {
    engine_dir: PathBuf,
    config: EngineConfig,
    settings: SessionSettings,
    tokenizer: TokenizerSession,
    lifecycle: RequestLifecycle,
    aggregator: ResponseAggregator,
    engine: Box<dyn GenerationEngine>,
    shut_down: bool,
}

impl InferenceSession {
    /// Loads the engine configuration, then the tokenizer, then launches the
    /// engine. Any failure aborts before the engine is touched.
    pub fn initialize(
        engine_dir: &Path,
        settings: SessionSettings,
        launcher: &dyn EngineLauncher,
    ) -> Result<Self> {
        let config = load_engine_config(engine_dir)?;

        let tokenizer_dir = settings.tokenizer_dir.as_deref().unwrap_or(engine_dir);
        let tokenizer = TokenizerSession::initialize(tokenizer_dir)?;

        let engine = launcher.launch(engine_dir, &config, tokenizer.end_id())?;
        tracing::info!(
            engine_dir = %engine_dir.display(),
            max_batch_size = config.max_batch_size,
            max_beam_width = config.max_beam_width,
            max_num_tokens = config.max_num_tokens,
            "session initialized"
        );

        let mut session = Self::from_parts(config, settings, tokenizer, engine);
        session.engine_dir = engine_dir.to_path_buf();
        Ok(session)
    }

    pub fn from_parts(
        config: EngineConfig,
        settings: SessionSettings,
        tokenizer: TokenizerSession,
        engine: Box<dyn GenerationEngine>,
    ) -> Self {
        let lifecycle = RequestLifecycle::new(&config, tokenizer.end_id());
        Self {
            engine_dir: PathBuf::new(),
            config,
            settings,
            tokenizer,
            lifecycle,
            aggregator: ResponseAggregator::new(),
            engine,
            shut_down: false,
        }
    }

    pub fn build_request(
        &mut self,
        input: PromptInput,
        options: &RequestOptions,
    ) -> Result<GenerationRequest> {
        self.lifecycle.build_request(input, options, &self.tokenizer)
    }

    pub fn engine_dir(&self) -> &Path {
        &self.engine_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn tokenizer(&self) -> &TokenizerSession {
        &self.tokenizer
    }

    /// Admitted requests whose result has not been produced yet.
    pub fn outstanding(&self) -> usize {
        self.aggregator.outstanding()
    }

    /// Stops tracking a request. The engine may keep generating it; its events
    /// are dropped.
    pub fn abandon(&mut self, request_id: RequestId) -> bool {
        self.aggregator.abandon(request_id)
    }

    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let abandoned = self.aggregator.outstanding();
        self.engine.shutdown();
        tracing::info!(abandoned, "session shut down");
    }

    fn submit(&mut self, request: GenerationRequest) -> Result<SubmitOutcome> {
        let outcome = self.lifecycle.submit(self.engine.as_mut(), request)?;
        if let SubmitOutcome::Admitted { request_id, ticket } = &outcome {
            if !self.aggregator.track(*request_id, *ticket) {
                return Err(crate::error::EngineError::Enqueue(format!(
                    "engine returned duplicate request id {}",
                    request_id
                ))
                .into());
            }
        }
        Ok(outcome)
    }

    /// Waits for engine output. Returns how many events arrived and the
    /// requests that finished.
    fn collect(&mut self, timeout: std::time::Duration) -> (usize, Vec<GenerationResult>) {
        let responses = self.aggregator.poll(self.engine.as_mut(), timeout);
        let events = responses.len();
        (events, self.aggregator.absorb(responses, &self.tokenizer))
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
