//! Hardware detection and GPU memory queries
//!
//! Detects the available compute backend in priority order:
//! CUDA (NVIDIA) → ROCm (AMD) → Vulkan (cross-vendor) → CPU
//!
//! Detection uses device-node probes and the vendor CLIs (`nvidia-smi`,
//! `rocm-smi`) rather than linking GPU libraries at compile time. Only CUDA
//! and ROCm report device memory; a Vulkan-only host is treated as having no
//! measurable VRAM.

use locallab_kernel::types::GpuMemory;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MIB: u64 = 1024 * 1024;

/// Compute backends the host can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ComputeBackend {
    Cuda,
    Rocm,
    Vulkan,
    Cpu,
}

impl ComputeBackend {
    /// Whether free device memory can be queried for this backend.
    pub fn reports_vram(self) -> bool {
        matches!(self, Self::Cuda | Self::Rocm)
    }
}

impl std::fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeBackend::Cuda => write!(f, "CUDA"),
            ComputeBackend::Rocm => write!(f, "ROCm"),
            ComputeBackend::Vulkan => write!(f, "Vulkan"),
            ComputeBackend::Cpu => write!(f, "CPU"),
        }
    }
}

/// Static description of the host, gathered once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// Best available compute backend
    pub backend: ComputeBackend,
    /// All backends detected on this system, best first
    pub available_backends: Vec<ComputeBackend>,
    /// Device memory at detection time, when the backend reports it
    pub gpu: Option<GpuMemory>,
    pub total_ram_mb: u64,
    pub cpu_cores: usize,
}

impl HardwareInfo {
    /// Detect the host hardware.
    ///
    /// Runs synchronously; call from a blocking context or `spawn_blocking`.
    pub fn detect() -> Self {
        let mut available = Vec::new();

        if Path::new("/dev/nvidia0").exists() {
            available.push(ComputeBackend::Cuda);
        }
        if Path::new("/dev/kfd").exists() {
            available.push(ComputeBackend::Rocm);
        }
        if detect_vulkan() {
            available.push(ComputeBackend::Vulkan);
        }
        available.push(ComputeBackend::Cpu);

        let backend = available[0];
        let gpu = query_gpu_memory(backend);

        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        Self {
            backend,
            available_backends: available,
            gpu,
            total_ram_mb: sys.total_memory() / MIB,
            cpu_cores: num_cpus(),
        }
    }
}

/// Query current device memory for `backend`.
///
/// Returns `None` when the backend has no device memory or the vendor CLI
/// is missing or fails.
pub fn query_gpu_memory(backend: ComputeBackend) -> Option<GpuMemory> {
    match backend {
        ComputeBackend::Cuda => {
            let output = Command::new("nvidia-smi")
                .args([
                    "--query-gpu=memory.total,memory.free",
                    "--format=csv,noheader,nounits",
                ])
                .output()
                .ok()?;
            if !output.status.success() {
                return None;
            }
            parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
        }
        ComputeBackend::Rocm => {
            let output = Command::new("rocm-smi")
                .args(["--showmeminfo", "vram", "--csv"])
                .output()
                .ok()?;
            if !output.status.success() {
                return None;
            }
            parse_rocm_smi(&String::from_utf8_lossy(&output.stdout))
        }
        _ => None,
    }
}

/// Parse `nvidia-smi --query-gpu=memory.total,memory.free` output (MiB).
///
/// Only the first GPU is considered.
fn parse_nvidia_smi(stdout: &str) -> Option<GpuMemory> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split(',').map(str::trim);
    let total_mb = fields.next()?.parse().ok()?;
    let free_mb = fields.next()?.parse().ok()?;
    Some(GpuMemory { total_mb, free_mb })
}

/// Parse `rocm-smi --showmeminfo vram --csv` output.
///
/// CSV layout: `device,VRAM Total Memory (B),VRAM Total Used Memory (B)`
fn parse_rocm_smi(stdout: &str) -> Option<GpuMemory> {
    for line in stdout.lines().skip(1) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            continue;
        }
        if let (Ok(total), Ok(used)) = (parts[1].parse::<u64>(), parts[2].parse::<u64>()) {
            return Some(GpuMemory {
                total_mb: total / MIB,
                free_mb: total.saturating_sub(used) / MIB,
            });
        }
    }
    None
}

fn detect_vulkan() -> bool {
    if Path::new("/dev/dri/renderD128").exists() {
        return true;
    }

    Command::new("vulkaninfo")
        .arg("--summary")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
