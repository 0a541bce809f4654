//! Engine configuration: read the build limits from an engine directory and
//! compose them with the fixed operational policies into one immutable record.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Relative path of the build configuration inside an engine directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_MAX_SEQ_IDLE: Duration = Duration::from_secs(180);
pub const DEFAULT_ITER_STATS_MAX_ITERATIONS: u32 = 1000;
pub const DEFAULT_REQUEST_STATS_MAX_ITERATIONS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacitySchedulerPolicy {
    /// Only admit what can run to completion without evicting anything.
    GuaranteedNoEvict,
    MaxUtilization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChunkingPolicy {
    FirstComeFirstServed,
    EqualProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub capacity_policy: CapacitySchedulerPolicy,
    pub context_chunking: ContextChunkingPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity_policy: CapacitySchedulerPolicy::GuaranteedNoEvict,
            context_chunking: ContextChunkingPolicy::FirstComeFirstServed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvCacheConfig {
    pub enable_block_reuse: bool,
    pub max_tokens: Option<u32>,
    pub sink_token_length: Option<u32>,
    pub free_gpu_memory_fraction: Option<f32>,
    pub host_cache_size: Option<u64>,
    pub onboard_blocks: bool,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            enable_block_reuse: false,
            max_tokens: None,
            sink_token_length: None,
            free_gpu_memory_fraction: None,
            host_cache_size: None,
            onboard_blocks: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchingType {
    Static,
    Inflight,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfKnobs {
    pub multi_block_mode: bool,
    pub enable_context_fmha_fp32_acc: bool,
    pub enable_chunked_context: bool,
    pub normalize_log_probs: bool,
    pub gpu_weights_percent: f32,
    pub batching_type: BatchingType,
    pub recv_poll_period_ms: u32,
    pub max_queue_size: Option<u32>,
}

impl Default for PerfKnobs {
    fn default() -> Self {
        Self {
            multi_block_mode: true,
            enable_context_fmha_fp32_acc: false,
            enable_chunked_context: false,
            normalize_log_probs: false,
            gpu_weights_percent: 1.0,
            batching_type: BatchingType::Inflight,
            recv_poll_period_ms: 0,
            max_queue_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeftCacheConfig {
    pub num_host_module_layer: u32,
    pub num_device_module_layer: u32,
    pub optimal_adapter_size: u32,
    pub max_adapter_size: u32,
    pub num_put_workers: u32,
    pub num_ensure_workers: u32,
    pub num_copy_streams: u32,
    pub max_pages_per_block_host: u32,
    pub max_pages_per_block_device: u32,
}

impl Default for PeftCacheConfig {
    fn default() -> Self {
        Self {
            num_host_module_layer: 0,
            num_device_module_layer: 0,
            optimal_adapter_size: 8,
            max_adapter_size: 64,
            num_put_workers: 1,
            num_ensure_workers: 1,
            num_copy_streams: 1,
            max_pages_per_block_host: 24,
            max_pages_per_block_device: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationType {
    Mpi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationMode {
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    pub comm_type: CommunicationType,
    pub comm_mode: CommunicationMode,
    pub participant_count: u32,
    pub device_ids: Option<Vec<u32>>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            comm_type: CommunicationType::Mpi,
            comm_mode: CommunicationMode::Leader,
            participant_count: 1,
            device_ids: None,
        }
    }
}

/// Immutable engine configuration, built once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_beam_width: u32,
    pub max_batch_size: u32,
    pub max_num_tokens: u32,
    pub max_input_len: Option<u32>,
    pub max_seq_len: Option<u32>,
    pub scheduler: SchedulerConfig,
    pub kv_cache: KvCacheConfig,
    pub perf: PerfKnobs,
    pub peft_cache: PeftCacheConfig,
    pub parallel: ParallelConfig,
    pub max_seq_idle: Duration,
    pub iter_stats_max_iterations: u32,
    pub request_stats_max_iterations: u32,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Collects every field before validating them together in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    max_beam_width: Option<i64>,
    max_batch_size: Option<i64>,
    max_num_tokens: Option<i64>,
    max_input_len: Option<i64>,
    max_seq_len: Option<i64>,
    scheduler: SchedulerConfig,
    kv_cache: KvCacheConfig,
    perf: PerfKnobs,
    peft_cache: PeftCacheConfig,
    parallel: ParallelConfig,
    max_seq_idle: Duration,
    iter_stats_max_iterations: u32,
    request_stats_max_iterations: u32,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            max_beam_width: None,
            max_batch_size: None,
            max_num_tokens: None,
            max_input_len: None,
            max_seq_len: None,
            scheduler: SchedulerConfig::default(),
            kv_cache: KvCacheConfig::default(),
            perf: PerfKnobs::default(),
            peft_cache: PeftCacheConfig::default(),
            parallel: ParallelConfig::default(),
            max_seq_idle: DEFAULT_MAX_SEQ_IDLE,
            iter_stats_max_iterations: DEFAULT_ITER_STATS_MAX_ITERATIONS,
            request_stats_max_iterations: DEFAULT_REQUEST_STATS_MAX_ITERATIONS,
        }
    }
}

impl EngineConfigBuilder {
    pub fn max_beam_width(mut self, value: i64) -> Self {
        self.max_beam_width = Some(value);
        self
    }

    pub fn max_batch_size(mut self, value: i64) -> Self {
        self.max_batch_size = Some(value);
        self
    }

    pub fn max_num_tokens(mut self, value: i64) -> Self {
        self.max_num_tokens = Some(value);
        self
    }

    pub fn max_input_len(mut self, value: Option<i64>) -> Self {
        self.max_input_len = value;
        self
    }

    pub fn max_seq_len(mut self, value: Option<i64>) -> Self {
        self.max_seq_len = value;
        self
    }

    pub fn scheduler(mut self, value: SchedulerConfig) -> Self {
        self.scheduler = value;
        self
    }

    pub fn kv_cache(mut self, value: KvCacheConfig) -> Self {
        self.kv_cache = value;
        self
    }

    pub fn perf(mut self, value: PerfKnobs) -> Self {
        self.perf = value;
        self
    }

    pub fn participant_count(mut self, value: u32) -> Self {
        self.parallel.participant_count = value;
        self
    }

    pub fn max_seq_idle(mut self, value: Duration) -> Self {
        self.max_seq_idle = value;
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let max_beam_width = required_positive("build_config.max_beam_width", self.max_beam_width)?;
        let max_batch_size = required_positive("build_config.max_batch_size", self.max_batch_size)?;
        let max_num_tokens = required_positive("build_config.max_num_tokens", self.max_num_tokens)?;
        let max_input_len = optional_positive("build_config.max_input_len", self.max_input_len)?;
        let max_seq_len = optional_positive("build_config.max_seq_len", self.max_seq_len)?;

        if let (Some(input), Some(seq)) = (max_input_len, max_seq_len) {
            if input > seq {
                return Err(ConfigError::Invalid {
                    field: "build_config.max_input_len",
                    reason: format!("{} exceeds max_seq_len {}", input, seq),
                });
            }
        }

        if self.parallel.participant_count == 0 {
            return Err(ConfigError::Invalid {
                field: "mapping.world_size",
                reason: "must be >= 1".to_string(),
            });
        }

        if !(self.perf.gpu_weights_percent > 0.0 && self.perf.gpu_weights_percent <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "gpu_weights_percent",
                reason: format!("{} not in (0, 1]", self.perf.gpu_weights_percent),
            });
        }

        if let Some(fraction) = self.kv_cache.free_gpu_memory_fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError::Invalid {
                    field: "kv_cache.free_gpu_memory_fraction",
                    reason: format!("{} not in (0, 1]", fraction),
                });
            }
        }

        Ok(EngineConfig {
            max_beam_width,
            max_batch_size,
            max_num_tokens,
            max_input_len,
            max_seq_len,
            scheduler: self.scheduler,
            kv_cache: self.kv_cache,
            perf: self.perf,
            peft_cache: self.peft_cache,
            parallel: self.parallel,
            max_seq_idle: self.max_seq_idle,
            iter_stats_max_iterations: self.iter_stats_max_iterations,
            request_stats_max_iterations: self.request_stats_max_iterations,
        })
    }
}

fn required_positive(field: &'static str, value: Option<i64>) -> Result<u32, ConfigError> {
    let value = value.ok_or_else(|| ConfigError::Invalid {
        field,
        reason: "missing".to_string(),
    })?;
    to_positive(field, value)
}

fn optional_positive(field: &'static str, value: Option<i64>) -> Result<Option<u32>, ConfigError> {
    value.map(|v| to_positive(field, v)).transpose()
}

fn to_positive(field: &'static str, value: i64) -> Result<u32, ConfigError> {
    if value < 1 || value > i64::from(u32::MAX) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{} is not a positive 32-bit limit", value),
        });
    }
    Ok(value as u32)
}

#[derive(Debug, Deserialize)]
struct EngineFile {
    build_config: BuildSection,
    #[serde(default)]
    mapping: Option<MappingSection>,
}

#[derive(Debug, Deserialize)]
struct BuildSection {
    max_beam_width: i64,
    max_batch_size: i64,
    max_num_tokens: i64,
    #[serde(default)]
    max_input_len: Option<i64>,
    #[serde(default)]
    max_seq_len: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MappingSection {
    #[serde(default)]
    world_size: Option<u32>,
}

pub fn config_path(engine_dir: &Path) -> PathBuf {
    engine_dir.join(CONFIG_FILE_NAME)
}

/// Reads `<engine_dir>/config.json` and builds the session's [`EngineConfig`].
///
/// Missing or mistyped required fields are a [`ConfigError::Parse`]; there is
/// no partial-config fallback.
pub fn load_engine_config(engine_dir: &Path) -> Result<EngineConfig, ConfigError> {
    if !engine_dir.is_dir() {
        return Err(ConfigError::MissingDirectory(engine_dir.to_path_buf()));
    }

    let path = config_path(engine_dir);
    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let file: EngineFile =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;

    let participants = file.mapping.and_then(|m| m.world_size).unwrap_or(1);

    let config = EngineConfig::builder()
        .max_beam_width(file.build_config.max_beam_width)
        .max_batch_size(file.build_config.max_batch_size)
        .max_num_tokens(file.build_config.max_num_tokens)
        .max_input_len(file.build_config.max_input_len)
        .max_seq_len(file.build_config.max_seq_len)
        .participant_count(participants)
        .build()?;

    tracing::debug!(
        path = %path.display(),
        max_beam_width = config.max_beam_width,
        max_batch_size = config.max_batch_size,
        max_num_tokens = config.max_num_tokens,
        participants = config.parallel.participant_count,
        "engine config loaded"
    );
    Ok(config)
}
