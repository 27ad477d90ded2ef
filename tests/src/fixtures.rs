//! Registry and configuration fixtures.
//!
//! Memory figures are in MB. A model fits when free RAM exceeds its minimum
//! and stays at or above the default 2048 MB floor: `small` needs 2048 MB
//! free, `medium` more than 3000 MB and `large` more than 14000 MB.

use std::sync::Arc;

use locallab_core::InferenceCore;
use locallab_core::monitor::ResourceProbe;
use locallab_kernel::config::LocalLabConfig;
use locallab_kernel::registry::StaticRegistry;
use locallab_kernel::types::{ModelDescriptor, OptimizationKind};

use crate::runtime::MockRuntime;

pub const SMALL: &str = "small";
pub const MEDIUM: &str = "medium";
pub const LARGE: &str = "large";

pub fn small() -> ModelDescriptor {
    ModelDescriptor::new(SMALL, 500_000_000, 1000)
        .with_name("Small 0.5B")
        .with_optimizations([OptimizationKind::Int8, OptimizationKind::FlashAttention])
}

pub fn medium() -> ModelDescriptor {
    ModelDescriptor::new(MEDIUM, 3_000_000_000, 3000)
        .with_name("Medium 3B")
        .with_min_vram(2500)
        .with_optimizations([
            OptimizationKind::Int8,
            OptimizationKind::Int4,
            OptimizationKind::FlashAttention,
        ])
        .with_fallback(SMALL)
}

pub fn large() -> ModelDescriptor {
    ModelDescriptor::new(LARGE, 13_000_000_000, 14_000)
        .with_name("Large 13B")
        .with_max_length(1024)
        .with_fallback(SMALL)
}

pub fn models() -> Vec<ModelDescriptor> {
    vec![small(), medium(), large()]
}

pub fn registry() -> Arc<StaticRegistry> {
    Arc::new(StaticRegistry::new(models()))
}

/// Defaults plus the fixture model table.
pub fn config() -> LocalLabConfig {
    LocalLabConfig {
        models: models(),
        ..LocalLabConfig::default()
    }
}

/// Core over the fixture registry.
pub fn core(config: LocalLabConfig, runtime: &MockRuntime, probe: Arc<dyn ResourceProbe>) -> InferenceCore {
    let registry = Arc::new(StaticRegistry::new(config.models.clone()));
    InferenceCore::with_components(config, Arc::new(runtime.clone()), registry, probe)
        .expect("fixture config is valid")
}
