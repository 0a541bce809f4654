//! Orchestration around a batched text-generation engine: configuration,
//! tokenization, request admission, streamed response aggregation, and the
//! batch and server run modes.

pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod session;
pub mod settings;
pub mod tokenizer;
pub mod topology;

#[cfg(test)]
mod testing;

pub use config::{load_engine_config, EngineConfig};
pub use engine::{EngineLauncher, GenerationEngine, LoopbackLauncher};
pub use error::{Result, SessionError};
pub use session::{GenerationResult, InferenceSession};
pub use settings::SessionSettings;
pub use tokenizer::TokenizerSession;
pub use topology::ProcessTopology;
