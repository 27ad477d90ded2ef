use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use locallab_core::monitor::{ProbeError, ResourceProbe};
use locallab_kernel::types::{GpuMemory, ResourceSnapshot};
use parking_lot::Mutex;

/// Resource probe returning whatever the test sets.
pub struct ScriptedProbe {
    reading: Mutex<Reading>,
    samples: AtomicUsize,
}

struct Reading {
    total_ram_mb: u64,
    free_ram_mb: u64,
    gpu: Option<GpuMemory>,
    failure: Option<String>,
}

impl ScriptedProbe {
    /// CPU-only host with `free_ram_mb` of free memory.
    pub fn new(free_ram_mb: u64) -> Self {
        Self {
            reading: Mutex::new(Reading {
                total_ram_mb: free_ram_mb.max(16_384),
                free_ram_mb,
                gpu: None,
                failure: None,
            }),
            samples: AtomicUsize::new(0),
        }
    }

    /// Host with plenty of memory.
    pub fn roomy() -> Self {
        Self::new(64_000)
    }

    pub fn with_gpu(self, total_mb: u64, free_mb: u64) -> Self {
        self.reading.lock().gpu = Some(GpuMemory { total_mb, free_mb });
        self
    }

    pub fn set_free_ram(&self, free_ram_mb: u64) {
        self.reading.lock().free_ram_mb = free_ram_mb;
    }

    pub fn set_free_vram(&self, free_mb: u64) {
        let mut reading = self.reading.lock();
        let total_mb = reading.gpu.map_or(free_mb, |g| g.total_mb.max(free_mb));
        reading.gpu = Some(GpuMemory { total_mb, free_mb });
    }

    /// Make every sample fail until [`recover`](Self::recover).
    pub fn fail(&self, message: &str) {
        self.reading.lock().failure = Some(message.to_string());
    }

    pub fn recover(&self) {
        self.reading.lock().failure = None;
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&self) -> Result<ResourceSnapshot, ProbeError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let reading = self.reading.lock();
        if let Some(message) = &reading.failure {
            return Err(ProbeError::new(message.clone()));
        }
        Ok(ResourceSnapshot {
            total_ram_mb: reading.total_ram_mb,
            free_ram_mb: reading.free_ram_mb,
            gpu: reading.gpu,
            cpu_load_percent: 12.5,
            degraded: false,
            sampled_at: Utc::now(),
        })
    }
}
