//! Error taxonomy for the inference core.
//!
//! [`InferenceError`] is what callers of the core observe. Every variant is
//! recovered at the scheduler / lifecycle-manager boundary and turned into a
//! result for the specific request(s) affected, so the type is `Clone`: one
//! load failure or one failed batch is delivered to many waiters.
//!
//! [`RuntimeError`] is the error type of the execution runtime collaborator.
//! Its [`RuntimeErrorKind`] decides whether a failed batch poisons the model
//! instance or leaves it ready for the next batch.

use std::fmt;
use thiserror::Error;

/// Errors surfaced by the inference core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InferenceError {
    /// The requested or selected model cannot fit the current hardware.
    #[error("Insufficient resources for model {model_id}: {reason}")]
    ResourceInsufficient { model_id: String, reason: String },

    /// The optimization configuration is invalid for the descriptor.
    #[error("Unsupported optimization for model {model_id}: {reason}")]
    UnsupportedOptimization { model_id: String, reason: String },

    /// The execution runtime failed to load the model.
    #[error("Model load failed for {model_id}: {reason}")]
    LoadFailure { model_id: String, reason: String },

    /// Admission refused (concurrency ceiling, queue timeout, memory pressure).
    #[error("Server overloaded: {0}")]
    Overloaded(String),

    /// A batch execution error.
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    /// Resource sampling failed. Reported, never fatal.
    #[error("Resource monitor degraded: {0}")]
    ResourceMonitorDegraded(String),

    /// The model id is not in the registry.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The caller abandoned the request before its result was delivered.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl InferenceError {
    pub fn resource_insufficient(model_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceInsufficient {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_optimization(
        model_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedOptimization {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }

    pub fn load_failure(model_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailure {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable snake_case label, suitable for a transport-level error code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceInsufficient { .. } => "resource_insufficient",
            Self::UnsupportedOptimization { .. } => "unsupported_optimization",
            Self::LoadFailure { .. } => "load_failure",
            Self::Overloaded(_) => "overloaded",
            Self::GenerationFailure(_) => "generation_failure",
            Self::ResourceMonitorDegraded(_) => "resource_monitor_degraded",
            Self::ModelNotFound(_) => "model_not_found",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
        }
    }

    /// Whether the same request may succeed if submitted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded(_) | Self::LoadFailure { .. })
    }
}

/// Result type for inference core operations
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Classification of an execution runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RuntimeErrorKind {
    /// The device or host ran out of memory mid-operation.
    OutOfMemory,
    /// The accelerator became unusable.
    DeviceLost,
    /// The runtime rejected the prompt or parameters.
    InvalidInput,
    /// Anything else.
    Internal,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::DeviceLost => write!(f, "device lost"),
            Self::InvalidInput => write!(f, "invalid input"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Error reported by the execution runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::OutOfMemory, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Internal, message)
    }

    /// An unrecoverable failure leaves the model instance unusable until it
    /// is reloaded.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self.kind,
            RuntimeErrorKind::OutOfMemory | RuntimeErrorKind::DeviceLost
        )
    }
}
