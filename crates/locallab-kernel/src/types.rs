//! Shared data model of the inference core.
//!
//! These types are the contract between the scheduler, the lifecycle
//! manager, the cache and the external collaborators (model registry and
//! execution runtime).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, InferenceResult};

// ============================================================================
// Optimizations
// ============================================================================

/// Weight quantization level requested at load time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationType {
    /// Load weights at the runtime's native precision
    #[default]
    None,
    Int8,
    Int4,
    Fp16,
}

impl QuantizationType {
    /// The optimization a descriptor must advertise for this level, if any.
    pub fn as_optimization(self) -> Option<OptimizationKind> {
        match self {
            Self::None => None,
            Self::Int8 => Some(OptimizationKind::Int8),
            Self::Int4 => Some(OptimizationKind::Int4),
            Self::Fp16 => Some(OptimizationKind::Fp16),
        }
    }

    /// Integer quantization pins weights to the accelerator.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int8 | Self::Int4)
    }
}

impl fmt::Display for QuantizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
            Self::Fp16 => write!(f, "fp16"),
        }
    }
}

/// An optimization a model variant may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    Int8,
    Int4,
    Fp16,
    AttentionSlicing,
    FlashAttention,
    CpuOffload,
    BetterTransformer,
}

impl fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
            Self::Fp16 => write!(f, "fp16"),
            Self::AttentionSlicing => write!(f, "attention_slicing"),
            Self::FlashAttention => write!(f, "flash_attention"),
            Self::CpuOffload => write!(f, "cpu_offload"),
            Self::BetterTransformer => write!(f, "better_transformer"),
        }
    }
}

/// The optimization flags forwarded to the execution runtime's `load`.
///
/// Each flag is independently toggleable; [`OptimizationConfig::validate_for`]
/// rejects combinations a descriptor cannot honour before any load attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub quantization: QuantizationType,
    pub flash_attention: bool,
    pub attention_slicing: bool,
    pub cpu_offload: bool,
    pub better_transformer: bool,
}

impl OptimizationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quantization(mut self, quantization: QuantizationType) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_flash_attention(mut self, enabled: bool) -> Self {
        self.flash_attention = enabled;
        self
    }

    pub fn with_attention_slicing(mut self, enabled: bool) -> Self {
        self.attention_slicing = enabled;
        self
    }

    pub fn with_cpu_offload(mut self, enabled: bool) -> Self {
        self.cpu_offload = enabled;
        self
    }

    pub fn with_better_transformer(mut self, enabled: bool) -> Self {
        self.better_transformer = enabled;
        self
    }

    /// Every optimization this configuration turns on.
    pub fn enabled(&self) -> Vec<OptimizationKind> {
        let mut kinds = Vec::new();
        if let Some(kind) = self.quantization.as_optimization() {
            kinds.push(kind);
        }
        if self.attention_slicing {
            kinds.push(OptimizationKind::AttentionSlicing);
        }
        if self.flash_attention {
            kinds.push(OptimizationKind::FlashAttention);
        }
        if self.cpu_offload {
            kinds.push(OptimizationKind::CpuOffload);
        }
        if self.better_transformer {
            kinds.push(OptimizationKind::BetterTransformer);
        }
        kinds
    }

    /// Check this configuration against what `descriptor` supports.
    ///
    /// # Errors
    /// - `UnsupportedOptimization`: a flag the descriptor does not list, or a
    ///   mutually exclusive pair.
    pub fn validate_for(&self, descriptor: &ModelDescriptor) -> InferenceResult<()> {
        let unsupported: Vec<String> = self
            .enabled()
            .into_iter()
            .filter(|kind| !descriptor.supports(*kind))
            .map(|kind| kind.to_string())
            .collect();
        if !unsupported.is_empty() {
            return Err(InferenceError::unsupported_optimization(
                &descriptor.id,
                format!("not supported by this model: {}", unsupported.join(", ")),
            ));
        }

        if self.flash_attention && self.attention_slicing {
            return Err(InferenceError::unsupported_optimization(
                &descriptor.id,
                "flash_attention cannot be combined with attention_slicing",
            ));
        }
        if self.flash_attention && self.better_transformer {
            return Err(InferenceError::unsupported_optimization(
                &descriptor.id,
                "flash_attention cannot be combined with better_transformer",
            ));
        }
        if self.cpu_offload && self.quantization.is_integer() {
            return Err(InferenceError::unsupported_optimization(
                &descriptor.id,
                format!("cpu_offload cannot be combined with {} quantization", self.quantization),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for OptimizationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let enabled = self.enabled();
        if enabled.is_empty() {
            return write!(f, "none");
        }
        let labels: Vec<String> = enabled.iter().map(|k| k.to_string()).collect();
        write!(f, "{}", labels.join("+"))
    }
}

// ============================================================================
// Model descriptor
// ============================================================================

fn default_max_length() -> usize {
    2048
}

/// Static metadata describing a model variant and its resource needs.
///
/// Immutable, sourced from the model registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Registry identifier (e.g. "qwen-0.5b")
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,
    /// Number of parameters
    pub parameter_count: u64,
    /// Minimum free system RAM required to load the model (MB)
    pub min_ram_mb: u64,
    /// Minimum free VRAM required when running on a GPU (MB)
    #[serde(default)]
    pub min_vram_mb: Option<u64>,
    /// Optimizations this variant can be loaded with
    #[serde(default)]
    pub supported_optimizations: BTreeSet<OptimizationKind>,
    /// Default generation length when a request does not set one
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Preferred substitute when this model cannot run
    #[serde(default)]
    pub fallback: Option<String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, parameter_count: u64, min_ram_mb: u64) -> Self {
        Self {
            id: id.into(),
            name: None,
            parameter_count,
            min_ram_mb,
            min_vram_mb: None,
            supported_optimizations: BTreeSet::new(),
            max_length: default_max_length(),
            fallback: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_min_vram(mut self, mb: u64) -> Self {
        self.min_vram_mb = Some(mb);
        self
    }

    pub fn with_optimizations(mut self, kinds: impl IntoIterator<Item = OptimizationKind>) -> Self {
        self.supported_optimizations.extend(kinds);
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn supports(&self, kind: OptimizationKind) -> bool {
        self.supported_optimizations.contains(&kind)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ============================================================================
// Requests and completions
// ============================================================================

/// Sampling parameters of one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum tokens to generate. `None` uses the model's `max_length`.
    pub max_tokens: Option<usize>,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Top-p nucleus sampling threshold
    pub top_p: f32,
    /// Generation stops at the first occurrence of any of these
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
        }
    }
}

impl GenerationParams {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_stop(mut self, stop: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    /// Fill `max_tokens` from the descriptor when the request left it unset.
    pub fn resolved_for(&self, descriptor: &ModelDescriptor) -> Self {
        let mut params = self.clone();
        params.max_tokens = Some(self.max_tokens.unwrap_or(descriptor.max_length));
        params
    }
}

/// One generation request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Unique request id
    pub id: String,
    /// Identifier of the submitting caller
    pub caller_id: String,
    /// Explicit model id. `None` uses the server's default model.
    pub model_id: Option<String>,
    pub prompt: String,
    pub params: GenerationParams,
    pub arrived_at: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(caller_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            caller_id: caller_id.into(),
            model_id: None,
            prompt: prompt.into(),
            params: GenerationParams::default(),
            arrived_at: Utc::now(),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// `max_tokens` was reached
    Length,
    /// A stop sequence was produced
    Stop,
    /// The runtime ended the sequence
    End,
}

/// A finished completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Number of token chunks the runtime produced
    pub token_count: usize,
    pub model_id: String,
    pub finish_reason: FinishReason,
    /// Served from the response cache
    pub cached: bool,
}

// ============================================================================
// Runtime-facing types
// ============================================================================

/// Opaque handle to a model resident in the execution runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelHandle {
    id: u64,
    model_id: String,
}

impl ModelHandle {
    pub fn new(id: u64, model_id: impl Into<String>) -> Self {
        Self {
            id,
            model_id: model_id.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Lifecycle state of a model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Unloading => write!(f, "unloading"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Resource snapshot
// ============================================================================

/// GPU memory reading in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuMemory {
    pub total_mb: u64,
    pub free_mb: u64,
}

/// Host resource availability at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub total_ram_mb: u64,
    pub free_ram_mb: u64,
    /// `None` when no GPU is present
    pub gpu: Option<GpuMemory>,
    /// Global CPU load (0.0–100.0)
    pub cpu_load_percent: f32,
    /// Sampling failed; admission checks treat the host as unconstrained
    pub degraded: bool,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Snapshot used when OS counters cannot be read.
    pub fn unconstrained() -> Self {
        Self {
            total_ram_mb: 0,
            free_ram_mb: 0,
            gpu: None,
            cpu_load_percent: 0.0,
            degraded: true,
            sampled_at: Utc::now(),
        }
    }

    pub fn free_vram_mb(&self) -> Option<u64> {
        self.gpu.map(|g| g.free_mb)
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }
}
