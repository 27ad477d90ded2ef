//! Execution runtime contract.
//!
//! The tensor-execution runtime is an opaque capability: given a descriptor
//! and a set of optimization flags it loads a model and produces tokens. The
//! core never touches tokenizers, weights or device placement directly, and
//! only the model lifecycle manager may call into this trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::RuntimeError;
use crate::types::{GenerationParams, ModelDescriptor, ModelHandle, OptimizationConfig};

/// Lazily produced, finite sequence of token chunks.
///
/// Dropping the stream abandons the generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, RuntimeError>> + Send>>;

/// Execution runtime trait - loads models and produces tokens
///
/// Implementers are responsible for:
/// - Loading weights with the requested optimization flags
/// - Streaming generated tokens for one prompt
/// - Releasing device memory on unload
#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    /// Runtime name, for logs
    fn name(&self) -> &str;

    /// Load a model and return a handle to it.
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        options: &OptimizationConfig,
    ) -> Result<ModelHandle, RuntimeError>;

    /// Unload a previously loaded model.
    async fn unload(&self, handle: &ModelHandle) -> Result<(), RuntimeError>;

    /// Start generating for `prompt`.
    ///
    /// `params.max_tokens` is always resolved by the caller.
    fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, RuntimeError>;

    /// How many generations of one batch may run concurrently against the
    /// same handle. `1` runs a batch sequentially.
    fn max_parallel_generations(&self) -> usize {
        1
    }
}
