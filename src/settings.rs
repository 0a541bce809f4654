//! Session-level settings: poll timeouts, admission retry policy and the
//! built-in prompt set. Loaded from an optional TOML file; every field has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_PROMPT: &str = "What is deep learning?";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    pub batch_poll_timeout_ms: u64,
    pub server_poll_timeout_ms: u64,
    /// Consecutive refusals without engine progress that end a batch run.
    pub admission_retries: u32,
    pub retry_delay_ms: u64,
    /// Ceiling for the doubling server-mode admission delay.
    pub max_retry_delay_ms: u64,
    /// Server mode drops a queued request after this many refused admission
    /// attempts. Unset means it waits for as long as it takes.
    pub serve_admission_limit: Option<u32>,
    /// Finished outcomes kept for `FETCH`; the oldest is evicted past this.
    pub max_retained_results: usize,
    pub default_max_new_tokens: u32,
    pub default_prompt: String,
    pub default_request_count: u32,
    /// Where to look for `tokenizer.json`; the engine directory when unset.
    pub tokenizer_dir: Option<PathBuf>,
    pub listen_host: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            batch_poll_timeout_ms: 5000,
            server_poll_timeout_ms: 5,
            admission_retries: 3,
            retry_delay_ms: 50,
            max_retry_delay_ms: 1000,
            serve_admission_limit: None,
            max_retained_results: 256,
            default_max_new_tokens: 17,
            default_prompt: DEFAULT_PROMPT.to_string(),
            default_request_count: 8,
            tokenizer_dir: None,
            listen_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    session: SessionSettings,
}

impl SessionSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&raw).map_err(|reason| ConfigError::Settings {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_toml(raw: &str) -> Result<Self, String> {
        let file: SettingsFile = toml::from_str(raw).map_err(|e| e.to_string())?;
        let settings = file.session;
        if settings.admission_retries == 0 {
            return Err("admission_retries must be >= 1".to_string());
        }
        if settings.serve_admission_limit == Some(0) {
            return Err("serve_admission_limit must be >= 1 when set".to_string());
        }
        if settings.default_max_new_tokens == 0 {
            return Err("default_max_new_tokens must be >= 1".to_string());
        }
        Ok(settings)
    }

    pub fn batch_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_poll_timeout_ms)
    }

    pub fn server_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.server_poll_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay before server-mode admission attempt `attempts + 1`: the retry
    /// delay doubled per refusal, capped at `max_retry_delay_ms`.
    pub fn admission_backoff(&self, attempts: u32) -> Duration {
        let doublings = attempts.saturating_sub(1).min(32);
        let delay = self.retry_delay_ms.saturating_mul(1u64 << doublings);
        Duration::from_millis(delay.min(self.max_retry_delay_ms.max(self.retry_delay_ms)))
    }
}
