//! Resource monitor
//!
//! Samples host memory, GPU memory and CPU load and answers the two
//! admission questions the core asks: can this model be loaded, and can one
//! more request be admitted. Sampling failures never propagate; the monitor
//! degrades to an unconstrained snapshot and logs a warning once per
//! transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use locallab_kernel::config::LocalLabConfig;
use locallab_kernel::error::{InferenceError, InferenceResult};
use locallab_kernel::types::{GenerationParams, ModelDescriptor, ResourceSnapshot};
use parking_lot::{Mutex, RwLock};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hardware::{ComputeBackend, HardwareInfo, query_gpu_memory};

const MIB: u64 = 1024 * 1024;

/// Rough bytes-per-token ratio used to estimate prompt length.
const CHARS_PER_TOKEN: usize = 4;

/// A sampling failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("resource probe failed: {0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Source of resource readings.
pub trait ResourceProbe: Send + Sync {
    /// Take one reading. May block briefly (vendor CLI calls).
    fn sample(&self) -> Result<ResourceSnapshot, ProbeError>;
}

/// Probe backed by `sysinfo` and the GPU vendor CLI.
pub struct SystemProbe {
    system: Mutex<System>,
    backend: ComputeBackend,
}

impl SystemProbe {
    /// Probe the backend detected on this host.
    pub fn new() -> Self {
        Self::with_backend(HardwareInfo::detect().backend)
    }

    pub fn with_backend(backend: ComputeBackend) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        Self {
            system: Mutex::new(system),
            backend,
        }
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> Result<ResourceSnapshot, ProbeError> {
        let (total, available, cpu) = {
            let mut sys = self.system.lock();
            sys.refresh_memory();
            sys.refresh_cpu_usage();
            (sys.total_memory(), sys.available_memory(), sys.global_cpu_usage())
        };

        // sysinfo reports 0 where the counters cannot be read
        if total == 0 || available == 0 {
            return Err(ProbeError::new("memory counters unavailable on this platform"));
        }

        let gpu = if self.backend.reports_vram() {
            query_gpu_memory(self.backend)
        } else {
            None
        };

        Ok(ResourceSnapshot {
            total_ram_mb: total / MIB,
            free_ram_mb: available / MIB,
            gpu,
            cpu_load_percent: cpu,
            degraded: false,
            sampled_at: Utc::now(),
        })
    }
}

/// Memory that unloading some resident instances would return (MB).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Reclaim {
    pub ram_mb: u64,
    pub vram_mb: u64,
}

/// Holds the latest snapshot. Readers never sample; the sampler task and
/// explicit refreshes keep it current.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    min_free_memory_mb: u64,
    kv_cache_kb_per_token: u64,
    refresh_interval: Duration,
    latest: RwLock<ResourceSnapshot>,
    degraded: Mutex<Option<String>>,
}

impl ResourceMonitor {
    /// Takes one reading up front so the first snapshot is real.
    pub fn new(probe: Arc<dyn ResourceProbe>, config: &LocalLabConfig) -> Self {
        let monitor = Self {
            probe,
            min_free_memory_mb: config.min_free_memory_mb,
            kv_cache_kb_per_token: config.kv_cache_kb_per_token,
            refresh_interval: config.resource_refresh_interval(),
            latest: RwLock::new(ResourceSnapshot::unconstrained()),
            degraded: Mutex::new(None),
        };
        monitor.refresh();
        monitor
    }

    /// Latest reading. Cheap; never touches the probe.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.latest.read().clone()
    }

    /// Sample now on the calling thread.
    ///
    /// The probe may shell out to a vendor CLI; async callers should use
    /// [`resample`](Self::resample) instead.
    pub fn refresh(&self) -> ResourceSnapshot {
        let snapshot = match self.probe.sample() {
            Ok(snapshot) => {
                if self.degraded.lock().take().is_some() {
                    info!(free_ram_mb = snapshot.free_ram_mb, "Resource sampling recovered");
                }
                snapshot
            }
            Err(e) => {
                let mut degraded = self.degraded.lock();
                if degraded.is_none() {
                    warn!(error = %e, "Resource sampling failed, assuming unconstrained");
                }
                *degraded = Some(e.to_string());
                ResourceSnapshot::unconstrained()
            }
        };

        *self.latest.write() = snapshot.clone();
        snapshot
    }

    /// [`refresh`](Self::refresh) on the blocking pool.
    pub async fn resample(self: &Arc<Self>) -> ResourceSnapshot {
        let monitor = Arc::clone(self);
        match tokio::task::spawn_blocking(move || monitor.refresh()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Resource sampling task failed, using last reading");
                self.snapshot()
            }
        }
    }

    /// `ResourceMonitorDegraded` while sampling is failing.
    pub fn degradation(&self) -> Option<InferenceError> {
        self.degraded
            .lock()
            .clone()
            .map(InferenceError::ResourceMonitorDegraded)
    }

    pub fn min_free_memory_mb(&self) -> u64 {
        self.min_free_memory_mb
    }

    /// Feasibility check of `descriptor` against the latest snapshot.
    pub fn can_run_model(&self, descriptor: &ModelDescriptor) -> bool {
        self.check_model(descriptor).is_ok()
    }

    /// Like [`can_run_model`](Self::can_run_model), with the shortfall as the error.
    ///
    /// Free RAM must exceed `min_ram_mb` and must not drop below the
    /// `min_free_memory_mb` floor. When a GPU is present and the descriptor
    /// names a VRAM minimum, free VRAM must exceed it too.
    pub fn check_model(&self, descriptor: &ModelDescriptor) -> InferenceResult<()> {
        let snapshot = self.snapshot();
        self.check_against(&snapshot, descriptor, Reclaim::default())
    }

    /// Feasibility with the memory an eviction would free credited back.
    pub(crate) fn check_against(
        &self,
        snapshot: &ResourceSnapshot,
        descriptor: &ModelDescriptor,
        reclaim: Reclaim,
    ) -> InferenceResult<()> {
        if snapshot.degraded {
            return Ok(());
        }

        let free_ram = snapshot.free_ram_mb + reclaim.ram_mb;
        if free_ram <= descriptor.min_ram_mb {
            return Err(InferenceError::resource_insufficient(
                &descriptor.id,
                format!(
                    "requires more than {} MB free RAM, {free_ram} MB available",
                    descriptor.min_ram_mb
                ),
            ));
        }
        if free_ram < self.min_free_memory_mb {
            return Err(InferenceError::resource_insufficient(
                &descriptor.id,
                format!(
                    "{free_ram} MB free RAM is below the {} MB floor",
                    self.min_free_memory_mb
                ),
            ));
        }

        if let (Some(gpu), Some(min_vram)) = (snapshot.gpu, descriptor.min_vram_mb) {
            let free_vram = gpu.free_mb + reclaim.vram_mb;
            if free_vram <= min_vram {
                return Err(InferenceError::resource_insufficient(
                    &descriptor.id,
                    format!("requires more than {min_vram} MB free VRAM, {free_vram} MB available"),
                ));
            }
        }
        Ok(())
    }

    /// Request-level memory check.
    ///
    /// The estimate is compared against free VRAM when a GPU is present and
    /// free RAM otherwise. A degraded monitor admits everything.
    pub fn can_admit_request(&self, estimated_cost_mb: u64) -> bool {
        let snapshot = self.snapshot();
        if snapshot.degraded {
            return true;
        }
        let free = snapshot.free_vram_mb().unwrap_or(snapshot.free_ram_mb);
        let admit = free >= estimated_cost_mb;
        if !admit {
            debug!(free_mb = free, estimated_cost_mb, "Request refused under memory pressure");
        }
        admit
    }

    /// Approximate KV-cache footprint of one request in MB.
    pub fn estimate_request_cost_mb(&self, prompt: &str, params: &GenerationParams) -> u64 {
        let prompt_tokens = prompt.len().div_ceil(CHARS_PER_TOKEN);
        let tokens = (prompt_tokens + params.max_tokens.unwrap_or(0)) as u64;
        (tokens * self.kv_cache_kb_per_token).div_ceil(1024)
    }

    /// Resample on a fixed interval until `shutdown` fires.
    pub fn spawn_sampler(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.refresh_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Resource sampler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        monitor.resample().await;
                    }
                }
            }
        })
    }
}
