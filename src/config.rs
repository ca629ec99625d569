use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PTP4L_CONF: &str = "/etc/linuxptp/ptp4l.conf";

/// Floor for every loop period and restart delay.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub tools: ToolConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorTiming,
    pub ptp4l_conf: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub pgrep: String,
    pub pmc: String,
    pub ethtool: String,
    pub phc_ctl: String,
    pub journalctl: String,
    pub tcpdump: String,
    pub daemon_process: String,     // matched exactly (pgrep -x)
    pub clock_sync_process: String, // matched against the full command line (pgrep -f)
    pub log_units: Vec<String>,
    pub command_timeout_ms: u64,
    pub pmc_domain: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub freshness_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorTiming {
    pub reconcile_tick_ms: u64,
    pub reaper_interval_ms: u64,
    pub idle_threshold_secs: u64,
    pub worker_poll_ms: u64,
    pub restart_backoff_min_ms: u64,
    pub restart_backoff_max_ms: u64,
    pub ptp_event_port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            tools: ToolConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorTiming::default(),
            ptp4l_conf: PathBuf::from(DEFAULT_PTP4L_CONF),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            pgrep: "pgrep".to_string(),
            pmc: "pmc".to_string(),
            ethtool: "ethtool".to_string(),
            phc_ctl: "phc_ctl".to_string(),
            journalctl: "journalctl".to_string(),
            tcpdump: "tcpdump".to_string(),
            daemon_process: "ptp4l".to_string(),
            clock_sync_process: "phc2sys".to_string(),
            log_units: vec!["ptp4l".to_string(), "phc2sys-custom".to_string()],
            command_timeout_ms: 2_000,
            pmc_domain: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { freshness_ms: 1_000 }
    }
}

impl Default for MonitorTiming {
    fn default() -> Self {
        MonitorTiming {
            reconcile_tick_ms: 2_000,
            reaper_interval_ms: 5_000,
            idle_threshold_secs: 120,
            worker_poll_ms: 200,
            restart_backoff_min_ms: 1_000,
            restart_backoff_max_ms: 30_000,
            ptp_event_port: crate::ptp::PTP_EVENT_PORT,
        }
    }
}

impl ToolConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

impl MonitorTiming {
    pub fn reconcile_tick(&self) -> Duration {
        Duration::from_millis(self.reconcile_tick_ms).max(MIN_PERIOD)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms).max(MIN_PERIOD)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms).max(MIN_PERIOD)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_min_ms).max(MIN_PERIOD)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_max_ms).max(self.backoff_min())
    }
}

impl DashboardConfig {
    /// Load from a JSON file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: DashboardConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        let m = &cfg.monitor;
        for (name, ms) in [
            ("reconcile_tick_ms", m.reconcile_tick_ms),
            ("reaper_interval_ms", m.reaper_interval_ms),
            ("worker_poll_ms", m.worker_poll_ms),
            ("restart_backoff_min_ms", m.restart_backoff_min_ms),
        ] {
            if Duration::from_millis(ms) < MIN_PERIOD {
                warn!("[Config] monitor.{} = {} is below the minimum, using {:?}", name, ms, MIN_PERIOD);
            }
        }
        Ok(cfg)
    }
}

/// Interface the daemon is configured for: the first `[section]` of
/// ptp4l.conf that is not `[global]`.
pub fn configured_interface(conf_text: &str) -> Option<String> {
    conf_text
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix('['))
        .filter_map(|rest| rest.split_once(']').map(|(name, _)| name.trim()))
        .find(|name| !name.is_empty() && *name != "global")
        .map(str::to_string)
}

/// Reads ptp4l.conf and resolves the configured interface. Unreadable files
/// resolve to `None`.
pub fn read_configured_interface(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => configured_interface(&text),
        Err(e) => {
            debug!("[Config] Cannot read {}: {}", path.display(), e);
            None
        }
    }
}
