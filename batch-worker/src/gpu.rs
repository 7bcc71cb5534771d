//! Best-effort GPU telemetry.
//!
//! The probe never fails a job on its own: a host without `nvidia-smi` (or a
//! wedged driver) simply reports `None` and the callers fall back to their
//! conservative defaults.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSnapshot {
    pub memory_percent: f64,
    pub utilization_percent: f64,
    pub temperature_c: f64,
    pub memory_free_bytes: u64,
}

#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn probe(&self) -> Option<GpuSnapshot>;
}

/// Shells out to `nvidia-smi` and parses its CSV output.
pub struct NvidiaSmiProbe;

#[async_trait]
impl GpuProbe for NvidiaSmiProbe {
    async fn probe(&self) -> Option<GpuSnapshot> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.used,memory.total,utilization.gpu,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            debug!(status = ?output.status, "nvidia-smi exited nonzero");
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_gpu = stdout.lines().next()?;
        parse_nvidia_smi_line(first_gpu)
    }
}

/// Parse one line of `memory.used, memory.total, utilization.gpu,
/// temperature.gpu` CSV output (MiB, MiB, %, °C).
fn parse_nvidia_smi_line(line: &str) -> Option<GpuSnapshot> {
    let mut fields = line.split(',').map(str::trim);
    let memory_used_mib: u64 = fields.next()?.parse().ok()?;
    let memory_total_mib: u64 = fields.next()?.parse().ok()?;
    let utilization_percent: f64 = fields.next()?.parse().ok()?;
    let temperature_c: f64 = fields.next()?.parse().ok()?;

    if memory_total_mib == 0 {
        return None;
    }

    Some(GpuSnapshot {
        memory_percent: memory_used_mib as f64 / memory_total_mib as f64 * 100.0,
        utilization_percent,
        temperature_c,
        memory_free_bytes: memory_total_mib.saturating_sub(memory_used_mib) * MIB,
    })
}

/// Fixed probe for tests and hosts without GPU telemetry.
pub struct StaticProbe(pub Option<GpuSnapshot>);

#[async_trait]
impl GpuProbe for StaticProbe {
    async fn probe(&self) -> Option<GpuSnapshot> {
        self.0
    }
}
