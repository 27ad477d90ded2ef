//! LocalLab kernel: the contracts shared by the inference core and its
//! collaborators.
//!
//! - [`types`]: descriptors, requests, completions, resource snapshots
//! - [`error`]: the error taxonomy callers observe
//! - [`runtime`]: the execution runtime trait the core drives
//! - [`registry`]: model registry lookup
//! - [`config`]: server configuration loading and validation

// config module
pub mod config;

// error module
pub mod error;

// registry module
pub mod registry;

// runtime module
pub mod runtime;

// types module
pub mod types;

pub use config::{ConfigError, LocalLabConfig, LogFormat};
pub use error::{InferenceError, InferenceResult, RuntimeError, RuntimeErrorKind};
pub use registry::{ModelRegistry, StaticRegistry};
pub use runtime::{ExecutionRuntime, TokenStream};
pub use types::*;
