//! Passive network monitor.
//!
//! A supervisor thread reconciles the desired [`MonitorConfig`] against the
//! set of running capture workers every tick. Workers write into a shared
//! [`PeerTable`]; a reaper thread expires idle peers.

pub mod capture;
pub mod peers;
pub mod worker;

#[cfg(test)]
pub(crate) mod fake;

use crate::config::MonitorTiming;
use crate::traits::InterfaceDirectory;
use anyhow::Result;
use capture::CaptureLauncher;
use log::{debug, info, warn};
use peers::{spawn_reaper, PeerObservation, PeerTable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use worker::{WorkerContext, WorkerHandle, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    #[default]
    Disabled,
    Passive,
}

impl std::str::FromStr for MonitorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(MonitorMode::Disabled),
            "passive" => Ok(MonitorMode::Passive),
            other => Err(format!("unknown monitor mode: {}", other)),
        }
    }
}

/// Desired monitoring state. Replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub mode: MonitorMode,
    pub interfaces: BTreeSet<String>,
}

impl MonitorConfig {
    /// Interfaces that should have a worker right now.
    pub fn desired(&self) -> BTreeSet<String> {
        match self.mode {
            MonitorMode::Passive => self.interfaces.clone(),
            MonitorMode::Disabled => BTreeSet::new(),
        }
    }
}

pub type SharedConfig = Arc<RwLock<MonitorConfig>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    #[error("passive monitoring needs at least one interface")]
    EmptyInterfaceSet,
}

struct Inner {
    config: SharedConfig,
    peers: Arc<PeerTable>,
    directory: Arc<dyn InterfaceDirectory>,
    launcher: Arc<dyn CaptureLauncher>,
    timing: MonitorTiming,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// Cleared by shutdown before the worker map is drained.
    running: Arc<AtomicBool>,
}

pub struct Supervisor {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Start the reconcile loop and the peer reaper. Monitoring begins
    /// disabled until [`Supervisor::set_config`] is called.
    pub fn start(
        peers: Arc<PeerTable>,
        directory: Arc<dyn InterfaceDirectory>,
        launcher: Arc<dyn CaptureLauncher>,
        timing: MonitorTiming,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::new(Inner {
            config: Arc::new(RwLock::new(MonitorConfig::default())),
            peers,
            directory,
            launcher,
            timing,
            workers: Mutex::new(HashMap::new()),
            running: running.clone(),
        });

        let reaper = spawn_reaper(inner.peers.clone(), inner.timing.reaper_interval(), running)?;

        let loop_inner = inner.clone();
        let reconciler = thread::Builder::new()
            .name("monitor-supervisor".to_string())
            .spawn(move || reconcile_loop(loop_inner))?;

        info!(
            "[Monitor] Supervisor started (tick {:?}, idle threshold {:?})",
            inner.timing.reconcile_tick(),
            inner.timing.idle_threshold()
        );
        Ok(Supervisor {
            inner,
            threads: Mutex::new(vec![reaper, reconciler]),
        })
    }

    /// Validate and atomically replace the desired state. Workers converge
    /// within one reconcile tick.
    pub fn set_config(&self, mode: MonitorMode, interfaces: &[String]) -> std::result::Result<(), MonitorError> {
        let interfaces: BTreeSet<String> = interfaces
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if mode == MonitorMode::Passive {
            if interfaces.is_empty() {
                warn!("[Monitor] Rejected passive mode without interfaces");
                return Err(MonitorError::EmptyInterfaceSet);
            }
            for name in &interfaces {
                if self.inner.directory.lookup(name).is_none() {
                    warn!("[Monitor] Rejected unknown interface {}", name);
                    return Err(MonitorError::UnknownInterface(name.clone()));
                }
            }
        }

        let next = MonitorConfig { mode, interfaces };
        info!("[Monitor] Config applied: {:?} {:?}", next.mode, next.interfaces);
        *self.inner.config.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot_peers(&self) -> Vec<PeerObservation> {
        self.inner.peers.snapshot()
    }

    pub fn worker_states(&self) -> BTreeMap<String, WorkerState> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state()))
            .collect()
    }

    /// Run one reconciliation pass immediately.
    pub fn reconcile_now(&self) {
        reconcile(&self.inner);
    }

    /// Stop the supervisor threads, then every worker. Each worker's
    /// subprocess is reaped before this returns.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let threads: Vec<_> = self.threads.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for t in threads {
            if t.join().is_err() {
                warn!("[Monitor] Background thread panicked");
            }
        }

        let workers: Vec<WorkerHandle> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &workers {
            handle.signal_stop();
        }
        for mut handle in workers {
            handle.stop();
        }
        info!("[Monitor] Supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reconcile_loop(inner: Arc<Inner>) {
    let tick = inner.timing.reconcile_tick();
    let slice = tick.min(Duration::from_millis(100));
    let mut last = Instant::now();
    reconcile(&inner);
    while inner.running.load(Ordering::SeqCst) {
        thread::sleep(slice);
        if last.elapsed() >= tick {
            reconcile(&inner);
            last = Instant::now();
        }
    }
    debug!("[Monitor] Reconcile loop stopped");
}

fn reconcile(inner: &Inner) {
    let desired = inner.config.read().unwrap_or_else(|e| e.into_inner()).desired();
    let mut retired = Vec::new();

    {
        let mut workers = inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock: shutdown clears the flag before it drains
        // the map, so nothing spawned here can be missed by that drain.
        let running = inner.running.load(Ordering::SeqCst);

        // Workers that ended on their own, or are no longer wanted.
        let names: Vec<String> = workers.keys().cloned().collect();
        for name in names {
            let gone = workers.get(&name).map_or(false, |h| h.is_finished());
            if gone || !desired.contains(&name) {
                if let Some(handle) = workers.remove(&name) {
                    handle.signal_stop();
                    retired.push(handle);
                }
            }
        }

        let missing: Vec<String> = if running {
            desired.iter().filter(|n| !workers.contains_key(*n)).cloned().collect()
        } else {
            Vec::new()
        };
        for name in missing {
            let Some(info) = inner.directory.lookup(&name) else {
                warn!("[Monitor] Interface {} disappeared, not starting capture", name);
                continue;
            };
            let ctx = WorkerContext {
                interface: name.clone(),
                addresses: info.addresses,
                launcher: inner.launcher.clone(),
                peers: inner.peers.clone(),
                config: inner.config.clone(),
                timing: inner.timing.clone(),
            };
            match WorkerHandle::spawn(ctx) {
                Ok(handle) => {
                    info!("[Monitor] Started capture worker for {}", name);
                    workers.insert(name, handle);
                }
                Err(e) => warn!("[Monitor] Could not start worker for {}: {}", name, e),
            }
        }
    }

    // Joined outside the lock so API reads never wait on a subprocess kill.
    for mut handle in retired {
        debug!("[Monitor] Retiring worker for {}", handle.interface());
        handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use crate::traits::{InterfaceInfo, MockInterfaceDirectory};
    use fake::{wait_until, FakeLauncher, SYNC_FROM_20};

    fn timing() -> MonitorTiming {
        MonitorTiming {
            reconcile_tick_ms: 20,
            reaper_interval_ms: 20,
            worker_poll_ms: 10,
            restart_backoff_min_ms: 10,
            restart_backoff_max_ms: 40,
            ..MonitorTiming::default()
        }
    }

    fn directory() -> Arc<MockInterfaceDirectory> {
        let mut dir = MockInterfaceDirectory::new();
        dir.expect_lookup().returning(|name| match name {
            "eth0" | "eth1" => Some(InterfaceInfo {
                name: name.to_string(),
                addresses: vec!["192.168.1.5".parse().unwrap()],
            }),
            _ => None,
        });
        Arc::new(dir)
    }

    fn supervisor(launcher: &Arc<FakeLauncher>) -> Supervisor {
        let peers = Arc::new(PeerTable::new(Arc::new(SystemClock), Duration::from_secs(120)));
        Supervisor::start(peers, directory(), launcher.clone(), timing()).unwrap()
    }

    fn supervisor_with_table(launcher: &Arc<FakeLauncher>, peers: Arc<PeerTable>) -> Supervisor {
        Supervisor::start(peers, directory(), launcher.clone(), timing()).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_starts_disabled() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        sup.reconcile_now();
        assert!(sup.worker_states().is_empty());
        assert_eq!(launcher.live(), 0);
    }

    #[test]
    fn test_rejects_unknown_interface_and_keeps_previous_config() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        sup.set_config(MonitorMode::Passive, &names(&["eth0"])).unwrap();

        let err = sup.set_config(MonitorMode::Passive, &names(&["eth0", "wlan9"])).unwrap_err();
        assert_eq!(err, MonitorError::UnknownInterface("wlan9".to_string()));
        assert_eq!(sup.config().interfaces, ["eth0".to_string()].into_iter().collect());
    }

    #[test]
    fn test_rejects_empty_passive_set() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        assert_eq!(
            sup.set_config(MonitorMode::Passive, &names(&[" "])),
            Err(MonitorError::EmptyInterfaceSet)
        );
        assert!(sup.set_config(MonitorMode::Disabled, &[]).is_ok());
    }

    #[test]
    fn test_converges_to_desired_set() {
        let _ = env_logger::builder().is_test(true).try_init();
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);

        sup.set_config(MonitorMode::Passive, &names(&["eth0", "eth1"])).unwrap();
        assert!(wait_until(Duration::from_secs(2), || launcher.live() == 2));
        assert!(wait_until(Duration::from_secs(2), || sup
            .worker_states()
            .values()
            .all(|s| *s == WorkerState::Running)));

        sup.set_config(MonitorMode::Passive, &names(&["eth1"])).unwrap();
        assert!(wait_until(Duration::from_secs(2), || launcher.live() == 1
            && sup.worker_states().keys().cloned().collect::<Vec<_>>() == vec!["eth1".to_string()]));

        sup.set_config(MonitorMode::Disabled, &[]).unwrap();
        assert!(wait_until(Duration::from_secs(2), || launcher.live() == 0
            && sup.worker_states().is_empty()));
    }

    #[test]
    fn test_peers_flow_through_to_snapshot() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        sup.set_config(MonitorMode::Passive, &names(&["eth0"])).unwrap();
        sup.reconcile_now();

        assert!(wait_until(Duration::from_secs(2), || launcher.emit("eth0", SYNC_FROM_20)
            && !sup.snapshot_peers().is_empty()));
        let peers = sup.snapshot_peers();
        assert_eq!(peers[0].peer_address.to_string(), "192.168.1.20");
        assert!(!peers[0].is_self);
    }

    #[test]
    fn test_shutdown_reaps_every_subprocess() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        sup.set_config(MonitorMode::Passive, &names(&["eth0", "eth1"])).unwrap();
        assert!(wait_until(Duration::from_secs(2), || launcher.live() == 2));

        sup.shutdown();
        assert_eq!(launcher.live(), 0);
        assert!(sup.worker_states().is_empty());
        sup.shutdown();
    }

    #[test]
    fn test_rapid_reconfiguration_leaves_no_strays() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        for i in 0..10 {
            let set = if i % 2 == 0 { names(&["eth0"]) } else { names(&["eth1"]) };
            sup.set_config(MonitorMode::Passive, &set).unwrap();
            sup.reconcile_now();
        }
        sup.set_config(MonitorMode::Disabled, &[]).unwrap();
        sup.reconcile_now();
        assert!(sup.worker_states().is_empty());
        assert!(wait_until(Duration::from_secs(2), || launcher.live() == 0));
    }

    #[test]
    fn test_stopped_worker_peers_linger_until_idle() {
        let launcher = FakeLauncher::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap()));
        let peers = Arc::new(PeerTable::new(clock.clone(), Duration::from_secs(120)));
        let sup = supervisor_with_table(&launcher, peers.clone());

        sup.set_config(MonitorMode::Passive, &names(&["eth0"])).unwrap();
        assert!(wait_until(Duration::from_secs(2), || launcher.emit("eth0", SYNC_FROM_20)
            && !sup.snapshot_peers().is_empty()));

        sup.set_config(MonitorMode::Disabled, &[]).unwrap();
        sup.reconcile_now();
        assert!(wait_until(Duration::from_secs(2), || launcher.live() == 0));
        assert_eq!(sup.snapshot_peers().len(), 1);

        clock.advance(Duration::from_secs(121));
        // Either this call or the background reaper removes it.
        peers.reap_expired();
        assert!(sup.snapshot_peers().is_empty());
    }

    #[test]
    fn test_reconcile_after_shutdown_starts_nothing() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);
        sup.set_config(MonitorMode::Passive, &names(&["eth0", "eth1"])).unwrap();
        sup.shutdown();
        let launched = launcher.launches("eth0") + launcher.launches("eth1");

        sup.reconcile_now();
        assert!(sup.worker_states().is_empty());
        assert_eq!(launcher.launches("eth0") + launcher.launches("eth1"), launched);
        assert_eq!(launcher.live(), 0);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("passive".parse::<MonitorMode>(), Ok(MonitorMode::Passive));
        assert_eq!(" Disabled ".parse::<MonitorMode>(), Ok(MonitorMode::Disabled));
        assert!("active".parse::<MonitorMode>().is_err());
    }
}
