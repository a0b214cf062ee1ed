use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Scheduler configuration, loadable from `~/.config/reqsched/config.toml`
/// and mutable at runtime through `Scheduler::set_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrent active transports across all hosts.
    pub maximum_requests: usize,
    /// Maximum concurrent active transports per host.
    pub maximum_requests_per_host: usize,
    /// When false, admission ignores both ceilings.
    #[serde(default = "default_true")]
    pub throttle: bool,
    /// When false, the per-(host, class) budget allocator is skipped and
    /// near-set members are admitted purely by capacity.
    #[serde(default = "default_true")]
    pub prioritize: bool,
    /// Tolerance band for the near-set computation: everything within
    /// `1 / nearness_factor` times the best priority competes this pass.
    /// A wide band avoids start/abort thrash for requests whose priority
    /// fluctuates marginally around the best.
    #[serde(default = "default_nearness")]
    pub nearness_factor: f64,
    /// When true, per-tick statistics are emitted to the tracing sink.
    #[serde(default)]
    pub debug_statistics: bool,
}

fn default_true() -> bool {
    true
}

fn default_nearness() -> f64 {
    0.1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maximum_requests: 10,
            maximum_requests_per_host: 6,
            throttle: true,
            prioritize: true,
            nearness_factor: 0.1,
            debug_statistics: false,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("reqsched")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SchedulerConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SchedulerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SchedulerConfig = toml::from_str(&data)?;
    Ok(cfg)
}
