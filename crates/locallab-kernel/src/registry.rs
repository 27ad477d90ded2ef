//! Model registry lookup.
//!
//! The registry is a read-only table of known model variants supplied to the
//! core at startup.

use crate::types::ModelDescriptor;

/// Read-only lookup of model descriptors.
pub trait ModelRegistry: Send + Sync {
    /// Descriptor for `id`, if known.
    fn descriptor_for(&self, id: &str) -> Option<ModelDescriptor>;

    /// Every known descriptor, largest parameter count first.
    fn descriptors(&self) -> Vec<ModelDescriptor>;
}

/// Registry backed by an in-memory table, usually the configured `models`.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    models: Vec<ModelDescriptor>,
}

impl StaticRegistry {
    pub fn new(mut models: Vec<ModelDescriptor>) -> Self {
        models.sort_by(|a, b| b.parameter_count.cmp(&a.parameter_count));
        Self { models }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl ModelRegistry for StaticRegistry {
    fn descriptor_for(&self, id: &str) -> Option<ModelDescriptor> {
        self.models.iter().find(|d| d.id == id).cloned()
    }

    fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.models.clone()
    }
}
