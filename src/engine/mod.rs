//! Container engine seam.
//!
//! Everything the sandbox lifecycle needs from the outside world goes through
//! [`ContainerEngine`]. The production implementation talks to Docker; tests
//! use an in-memory engine.

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerEngine;

/// Mount point of the per-sandbox bind directory inside every container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("{op} failed for {container}: {message}")]
    Api {
        op: &'static str,
        container: String,
        message: String,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub tty: bool,
    pub auto_remove: bool,
    /// Host path mounted read-write at [`CONTAINER_WORKSPACE`].
    pub bind_dir: String,
    pub working_dir: String,
    pub memory_bytes: i64,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
}

/// Exit code plus interleaved stdout/stderr of one exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Cumulative CPU counters as reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub container_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

/// CPU utilisation between two samples, in percent of one core.
///
/// Returns 0 when either counter went backwards or the system did not advance.
pub fn cpu_percent(previous: &CpuCounters, current: &CpuCounters) -> f64 {
    let cpu_delta = current.container_usage as i128 - previous.container_usage as i128;
    let system_delta = current.system_usage as i128 - previous.system_usage as i128;
    if cpu_delta < 0 || system_delta <= 0 {
        return 0.0;
    }
    let cpus = current.online_cpus.max(1) as f64;
    (cpu_delta as f64 / system_delta as f64) * cpus * 100.0
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Make sure `image` is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<(), EngineError>;

    async fn inspect(&self, name: &str) -> Result<ContainerStatus, EngineError>;

    async fn start(&self, name: &str) -> Result<(), EngineError>;

    async fn stop(&self, name: &str) -> Result<(), EngineError>;

    async fn restart(&self, name: &str) -> Result<(), EngineError>;

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, EngineError>;

    async fn stats(&self, name: &str) -> Result<CpuCounters, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(container_usage: u64, system_usage: u64, online_cpus: u32) -> CpuCounters {
        CpuCounters {
            container_usage,
            system_usage,
            online_cpus,
        }
    }

    #[test]
    fn test_cpu_percent_scales_by_online_cpus() {
        let pct = cpu_percent(&counters(100, 1_000, 4), &counters(150, 2_000, 4));
        assert!((pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_percent_guards_negative_deltas() {
        assert_eq!(cpu_percent(&counters(500, 1_000, 2), &counters(100, 2_000, 2)), 0.0);
        assert_eq!(cpu_percent(&counters(100, 2_000, 2), &counters(200, 2_000, 2)), 0.0);
        assert_eq!(cpu_percent(&counters(100, 3_000, 2), &counters(200, 2_000, 2)), 0.0);
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(EngineError::NotFound("x".into()).is_not_found());
        let api = EngineError::Api {
            op: "start",
            container: "x".into(),
            message: "boom".into(),
        };
        assert!(!api.is_not_found());
    }
}
