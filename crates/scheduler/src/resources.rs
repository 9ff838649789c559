//! Resource monitoring module
//!
//! Samples host CPU, memory and disk state and decides whether one more
//! encode may start. Snapshots are taken fresh on every check and dropped
//! immediately after the decision.

use crate::config::ResourceConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for host resource queries
#[derive(Debug, Error)]
pub enum ResourceQueryError {
    /// This platform is not supported by the system information backend
    #[error("resource monitoring is not supported on this platform")]
    Unsupported,

    /// CPU load could not be read
    #[error("CPU usage unavailable: {0}")]
    Cpu(String),

    /// Memory usage could not be read
    #[error("memory usage unavailable: {0}")]
    Memory(String),

    /// Free disk space could not be read
    #[error("disk usage unavailable for {path}: {reason}")]
    Disk { path: PathBuf, reason: String },
}

/// One reading of host resources
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub disk_free_percent: f32,
}

/// Limits a snapshot must satisfy before dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_max_percent: f32,
    pub mem_max_percent: f32,
    pub disk_min_free_percent: f32,
    pub disk_path: PathBuf,
    pub cpu_sample_interval: Duration,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self::from(&ResourceConfig::default())
    }
}

impl From<&ResourceConfig> for ResourceThresholds {
    fn from(cfg: &ResourceConfig) -> Self {
        Self {
            cpu_max_percent: cfg.cpu_max_percent,
            mem_max_percent: cfg.mem_max_percent,
            disk_min_free_percent: cfg.disk_min_free_percent,
            disk_path: cfg.disk_path.clone(),
            cpu_sample_interval: cfg.cpu_sample_interval(),
        }
    }
}

/// Which check refused dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Cpu,
    Memory,
    Disk,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::Cpu => write!(f, "cpu"),
            Denial::Memory => write!(f, "memory"),
            Denial::Disk => write!(f, "disk"),
        }
    }
}

/// Checks a snapshot against thresholds.
///
/// All three conditions are strict: a reading exactly at its limit denies.
/// Returns every failing check, empty when dispatch is allowed.
pub fn evaluate(snapshot: &ResourceSnapshot, thresholds: &ResourceThresholds) -> Vec<Denial> {
    let mut denials = Vec::new();
    if !(snapshot.cpu_percent < thresholds.cpu_max_percent) {
        denials.push(Denial::Cpu);
    }
    if !(snapshot.mem_percent < thresholds.mem_max_percent) {
        denials.push(Denial::Memory);
    }
    if !(snapshot.disk_free_percent > thresholds.disk_min_free_percent) {
        denials.push(Denial::Disk);
    }
    denials
}

/// Source of host resource readings.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Take a fresh snapshot, averaging CPU load over `cpu_interval`.
    async fn sample(
        &self,
        cpu_interval: Duration,
        disk_path: &Path,
    ) -> Result<ResourceSnapshot, ResourceQueryError>;
}

/// Sampler backed by `sysinfo`.
#[derive(Debug, Default, Clone)]
pub struct SysinfoSampler;

impl SysinfoSampler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(
        &self,
        cpu_interval: Duration,
        disk_path: &Path,
    ) -> Result<ResourceSnapshot, ResourceQueryError> {
        use sysinfo::System;

        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ResourceQueryError::Unsupported);
        }

        // A single refresh reports 0% load; usage is the delta across the window.
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(cpu_interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
        sys.refresh_cpu_usage();
        if sys.cpus().is_empty() {
            return Err(ResourceQueryError::Cpu("no CPUs reported".to_string()));
        }
        let cpu_percent = sys.global_cpu_usage();

        sys.refresh_memory();
        let total_memory = sys.total_memory();
        if total_memory == 0 {
            return Err(ResourceQueryError::Memory(
                "total memory reported as zero".to_string(),
            ));
        }
        let mem_percent = (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32;

        let disk = disk_usage(disk_path)?;
        tracing::trace!(
            path = %disk_path.display(),
            mount_point = %disk.mount_point.display(),
            "disk usage read"
        );

        Ok(ResourceSnapshot {
            cpu_percent,
            mem_percent,
            disk_free_percent: disk.free_percent,
        })
    }
}

/// Free space on one mounted filesystem
#[derive(Debug, Clone, PartialEq)]
pub struct DiskUsage {
    pub mount_point: PathBuf,
    pub free_percent: f32,
}

/// Free space on the filesystem holding `path`, as a percentage of its size.
///
/// Network shares and tmpfs mounts are listed too, so a path on a NAS is
/// measured on the share rather than on the local root disk.
pub fn disk_usage(path: &Path) -> Result<DiskUsage, ResourceQueryError> {
    use sysinfo::Disks;

    let disk_error = |reason: String| ResourceQueryError::Disk {
        path: path.to_path_buf(),
        reason,
    };

    let resolved = path
        .canonicalize()
        .map_err(|e| disk_error(e.to_string()))?;
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(&Path, u64, u64)> = disks
        .list()
        .iter()
        .map(|d| (d.mount_point(), d.available_space(), d.total_space()))
        .collect();

    let (mount_point, available, total) = find_mount(&resolved, &mounts)
        .ok_or_else(|| disk_error("no mounted filesystem contains this path".to_string()))?;
    if total == 0 {
        return Err(disk_error(format!(
            "filesystem at {} reports zero capacity",
            mount_point.display()
        )));
    }

    Ok(DiskUsage {
        mount_point: mount_point.to_path_buf(),
        free_percent: (available as f64 / total as f64 * 100.0) as f32,
    })
}

/// Picks the mount whose mount point is the longest prefix of `path`.
fn find_mount<'a>(
    path: &Path,
    mounts: &[(&'a Path, u64, u64)],
) -> Option<(&'a Path, u64, u64)> {
    mounts
        .iter()
        .filter(|(mount_point, _, _)| path.starts_with(mount_point))
        .max_by_key(|(mount_point, _, _)| mount_point.components().count())
        .copied()
}

/// Gatekeeper consulted before each dispatch.
pub struct ResourceMonitor {
    sampler: Box<dyn ResourceSampler>,
}

impl ResourceMonitor {
    pub fn new(sampler: Box<dyn ResourceSampler>) -> Self {
        Self { sampler }
    }

    /// Monitor reading the local host through `sysinfo`.
    pub fn system() -> Self {
        Self::new(Box::new(SysinfoSampler::new()))
    }

    /// Whether one more job may start now.
    ///
    /// Blocks for the CPU sampling interval. A failed query is returned as an
    /// error and must never be read as permission.
    pub async fn permits(
        &self,
        thresholds: &ResourceThresholds,
    ) -> Result<bool, ResourceQueryError> {
        let snapshot = self
            .sampler
            .sample(thresholds.cpu_sample_interval, &thresholds.disk_path)
            .await?;

        let denials = evaluate(&snapshot, thresholds);
        if denials.is_empty() {
            tracing::debug!(
                cpu = snapshot.cpu_percent,
                mem = snapshot.mem_percent,
                disk_free = snapshot.disk_free_percent,
                "resources permit dispatch"
            );
            return Ok(true);
        }

        let denied: Vec<String> = denials.iter().map(ToString::to_string).collect();
        tracing::debug!(
            cpu = snapshot.cpu_percent,
            mem = snapshot.mem_percent,
            disk_free = snapshot.disk_free_percent,
            denied = %denied.join(","),
            "resources deny dispatch"
        );
        Ok(false)
    }
}
