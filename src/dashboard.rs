//! Operations exposed to the web layer, wired to their collaborators.

use crate::bmca::{BmcaReport, BmcaSimulator};
use crate::cache::StatusCache;
use crate::clock::{Clock, SystemClock};
use crate::command::SystemCommandRunner;
use crate::config::DashboardConfig;
use crate::monitor::capture::{CaptureLauncher, ChildRegistry, TcpdumpLauncher};
use crate::monitor::peers::{PeerObservation, PeerTable};
use crate::monitor::worker::WorkerState;
use crate::monitor::{MonitorConfig, MonitorError, MonitorMode, Supervisor};
use crate::net::HostInterfaces;
use crate::status::{SnapshotSource, StatusBuilder, StatusSnapshot};
use crate::tools::PtpTools;
use crate::traits::{CommandRunner, InterfaceDirectory};
use anyhow::Result;
use log::info;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// External collaborators, replaceable in tests.
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub directory: Arc<dyn InterfaceDirectory>,
    pub launcher: Arc<dyn CaptureLauncher>,
    pub registry: Arc<ChildRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Real commands, real interfaces, real tcpdump.
    pub fn system(cfg: &DashboardConfig) -> Self {
        let registry = Arc::new(ChildRegistry::new());
        Collaborators {
            runner: Arc::new(SystemCommandRunner::new(cfg.tools.command_timeout())),
            directory: Arc::new(HostInterfaces),
            launcher: Arc::new(TcpdumpLauncher::new(&cfg.tools.tcpdump, registry.clone())),
            registry,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Read-only collaborator queries with no background threads. Used for
/// one-shot commands.
pub struct Queries {
    builder: StatusBuilder,
    bmca: BmcaSimulator,
    tools: PtpTools,
}

impl Queries {
    pub fn new(cfg: &DashboardConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let tools = PtpTools::new(runner, cfg.tools.clone());
        Queries {
            builder: StatusBuilder::new(tools.clone(), cfg.ptp4l_conf.clone()),
            bmca: BmcaSimulator::new(tools.clone()),
            tools,
        }
    }

    pub fn system(cfg: &DashboardConfig) -> Self {
        Self::new(cfg, Arc::new(SystemCommandRunner::new(cfg.tools.command_timeout())))
    }

    pub fn status(&self) -> StatusSnapshot {
        self.builder.build()
    }

    pub fn bmca(&self) -> BmcaReport {
        self.bmca.simulate()
    }

    pub fn recent_logs(&self, lines: usize) -> String {
        self.tools.recent_logs(lines)
    }
}

pub struct Dashboard {
    status: StatusCache<StatusBuilder>,
    bmca: BmcaSimulator,
    tools: PtpTools,
    monitor: Supervisor,
    registry: Arc<ChildRegistry>,
    stopped: AtomicBool,
}

impl Dashboard {
    pub fn new(cfg: &DashboardConfig) -> Result<Self> {
        Self::with_collaborators(cfg, Collaborators::system(cfg))
    }

    pub fn with_collaborators(cfg: &DashboardConfig, parts: Collaborators) -> Result<Self> {
        let tools = PtpTools::new(parts.runner, cfg.tools.clone());
        let builder = StatusBuilder::new(tools.clone(), cfg.ptp4l_conf.clone());
        let status = StatusCache::new(builder, parts.clock.clone(), cfg.cache.freshness());
        let peers = Arc::new(PeerTable::new(parts.clock, cfg.monitor.idle_threshold()));
        let monitor = Supervisor::start(peers, parts.directory, parts.launcher, cfg.monitor.clone())?;

        Ok(Dashboard {
            status,
            bmca: BmcaSimulator::new(tools.clone()),
            tools,
            monitor,
            registry: parts.registry,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.status.get_or_build().as_ref().clone()
    }

    pub fn get_bmca(&self) -> BmcaReport {
        self.bmca.simulate()
    }

    /// Current peers, most recently seen first.
    pub fn list_peers(&self) -> Vec<PeerObservation> {
        self.monitor.snapshot_peers()
    }

    pub fn apply_monitor_config(&self, mode: MonitorMode, interfaces: &[String]) -> Result<(), MonitorError> {
        self.monitor.set_config(mode, interfaces)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        self.monitor.config()
    }

    pub fn worker_states(&self) -> BTreeMap<String, WorkerState> {
        self.monitor.worker_states()
    }

    pub fn recent_logs(&self, lines: usize) -> String {
        self.tools.recent_logs(lines)
    }

    /// Stop monitoring, then kill any capture process that outlived its
    /// worker.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor.shutdown();
        self.registry.kill_all();
        info!("[Dashboard] Shut down");
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
