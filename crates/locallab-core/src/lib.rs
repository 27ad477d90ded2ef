//! # locallab-core
//!
//! Resource-aware inference core for locally hosted language models.
//!
//! Decides which model runs given the memory available, keeps a bounded set
//! of model instances loaded, caches completions, and batches concurrent
//! requests before handing them to an [`ExecutionRuntime`].
//!
//! | Component | Module |
//! |-----------|--------|
//! | Resource monitor | [`monitor`] |
//! | Model lifecycle manager | [`lifecycle`] |
//! | Response cache | [`cache`] |
//! | Request scheduler / batcher | [`scheduler`] |
//! | Facade wiring all of them | [`inference`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use locallab_core::InferenceCore;
//! use locallab_kernel::{ExecutionRuntime, InferenceError, InferenceResult, LocalLabConfig};
//!
//! async fn run(runtime: Arc<dyn ExecutionRuntime>) -> InferenceResult<()> {
//!     let config = LocalLabConfig::from_file("locallab.toml")
//!         .map_err(|report| InferenceError::Config(format!("{report:?}")))?;
//!     locallab_core::logging::init_from_config(&config);
//!
//!     let core = InferenceCore::new(config, runtime)?;
//!     core.start();
//!
//!     let completion = core.generate(core.request("cli", "Hello")).await?;
//!     println!("{}: {}", completion.model_id, completion.text);
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! [`ExecutionRuntime`]: locallab_kernel::ExecutionRuntime

pub mod cache;
mod generation;
pub mod hardware;
pub mod inference;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod scheduler;
pub mod stream;

pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use hardware::{ComputeBackend, HardwareInfo};
pub use inference::{InferenceCore, SystemInfo};
pub use lifecycle::{
    BatchItem, InstanceInfo, LifecycleSettings, ModelInstance, ModelLifecycleManager,
    ModelSelection, UnloadOutcome,
};
pub use monitor::{ProbeError, ResourceMonitor, ResourceProbe, SystemProbe};
pub use scheduler::{RequestScheduler, RequestState, SchedulerSettings, SchedulerStats};
pub use stream::CompletionStream;
