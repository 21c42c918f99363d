//! Runtime configuration: flags with environment fallbacks.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Settings applied to every sandbox handle.
#[derive(Args, Debug, Clone)]
pub struct SandboxConfig {
    /// Image every sandbox container is created from
    #[arg(long, env = "EXECUTOR_IMAGE", default_value = "python:3-slim")]
    pub image: String,

    /// Per-block execution timeout in seconds, enforced inside the container
    #[arg(long = "timeout", env = "EXECUTOR_TIMEOUT", default_value = "60")]
    pub timeout_secs: u64,

    /// Host-side root handed to the engine as bind-mount source
    #[arg(long, env = "EXECUTOR_BIND_DIR", default_value = "./code")]
    pub bind_dir: PathBuf,

    /// The same root as seen by this process
    #[arg(long, env = "EXECUTOR_WORK_DIR", default_value = "./code")]
    pub work_dir: PathBuf,

    /// Container memory limit (e.g. 512m, 1g)
    #[arg(long, env = "EXECUTOR_MEMORY_LIMIT", default_value = "512m")]
    pub memory_limit: String,

    /// Network the containers join; engine default when unset
    #[arg(long, env = "EXECUTOR_NETWORK")]
    pub network: Option<String>,

    /// Let the engine delete containers once they stop
    #[arg(
        long,
        env = "EXECUTOR_AUTO_REMOVE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_remove: bool,

    /// Seconds to wait for a container to report running
    #[arg(long = "start-timeout", env = "EXECUTOR_START_TIMEOUT", default_value = "60")]
    pub start_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3-slim".to_string(),
            timeout_secs: 60,
            bind_dir: PathBuf::from("./code"),
            work_dir: PathBuf::from("./code"),
            memory_limit: "512m".to_string(),
            network: None,
            auto_remove: true,
            start_timeout_secs: 60,
        }
    }
}

impl SandboxConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn memory_bytes(&self) -> Result<i64, String> {
        parse_memory_limit(&self.memory_limit)
    }
}

/// Settings for the idle reaper loop.
#[derive(Args, Debug, Clone)]
pub struct ReaperConfig {
    /// CPU percentage at or below which a sandbox counts as idle
    #[arg(long, env = "EXECUTOR_IDLE_THRESHOLD", default_value = "1.0")]
    pub idle_threshold: f64,

    /// Seconds a sandbox may stay idle before it is stopped
    #[arg(long = "idle-grace", env = "EXECUTOR_IDLE_GRACE", default_value = "300")]
    pub idle_grace_secs: u64,

    /// Seconds between utilisation samples
    #[arg(long = "reaper-interval", env = "EXECUTOR_REAPER_INTERVAL", default_value = "10")]
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_threshold: 1.0,
            idle_grace_secs: 300,
            interval_secs: 10,
        }
    }
}

impl ReaperConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Parse a docker-style memory string (`512m`, `1g`, `2048k`, `1048576`).
pub fn parse_memory_limit(value: &str) -> Result<i64, String> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("invalid memory limit: {value:?}"))?;
    if amount <= 0 {
        return Err(format!("memory limit must be positive: {value:?}"));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory limit overflows: {value:?}"))
}
