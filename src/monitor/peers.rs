use crate::clock::{age, Clock};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Most recent sighting of one PTP participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerObservation {
    pub peer_address: IpAddr,
    pub peer_link_address: String,
    pub interface: String,
    pub last_seen: DateTime<Utc>,
    pub is_self: bool,
}

struct Entry {
    observation: PeerObservation,
    /// Monotonic stamp of `observation.last_seen`, used for expiry.
    seen_at: Duration,
}

/// Peers keyed by transport address. Written by every capture worker,
/// read by the API, pruned by the reaper.
pub struct PeerTable {
    entries: RwLock<HashMap<IpAddr, Entry>>,
    clock: Arc<dyn Clock>,
    idle_threshold: Duration,
}

impl PeerTable {
    pub fn new(clock: Arc<dyn Clock>, idle_threshold: Duration) -> Self {
        PeerTable {
            entries: RwLock::new(HashMap::new()),
            clock,
            idle_threshold,
        }
    }

    /// Insert or refresh the entry for `address`.
    pub fn observe(&self, address: IpAddr, link_address: &str, interface: &str, is_self: bool) {
        let now = self.clock.now();
        let seen_at = self.clock.ticks();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&address) {
            Some(entry) => {
                entry.seen_at = seen_at;
                let existing = &mut entry.observation;
                existing.last_seen = now;
                existing.is_self = is_self;
                if existing.peer_link_address != link_address {
                    existing.peer_link_address = link_address.to_string();
                }
                if existing.interface != interface {
                    existing.interface = interface.to_string();
                }
            }
            None => {
                debug!("[Peers] New peer {} ({}) on {}", address, link_address, interface);
                entries.insert(
                    address,
                    Entry {
                        observation: PeerObservation {
                            peer_address: address,
                            peer_link_address: link_address.to_string(),
                            interface: interface.to_string(),
                            last_seen: now,
                            is_self,
                        },
                        seen_at,
                    },
                );
            }
        }
    }

    /// Copy of every entry, most recently seen first.
    pub fn snapshot(&self) -> Vec<PeerObservation> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ordered: Vec<&Entry> = entries.values().collect();
        // Monotonic order; `last_seen` can jump when the wall clock is stepped.
        ordered.sort_by(|a, b| {
            b.seen_at
                .cmp(&a.seen_at)
                .then(a.observation.peer_address.cmp(&b.observation.peer_address))
        });
        ordered.into_iter().map(|entry| entry.observation.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries idle for longer than the threshold. Returns how many.
    pub fn reap_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| age(self.clock.as_ref(), entry.seen_at) <= self.idle_threshold);
        let removed = before - entries.len();
        if removed > 0 {
            info!("[Peers] Expired {} idle peer(s), {} remaining", removed, entries.len());
        }
        removed
    }
}

/// Periodically reap `table` until `running` is cleared.
pub fn spawn_reaper(
    table: Arc<PeerTable>,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("peer-reaper".to_string())
        .spawn(move || {
            let slice = interval.min(Duration::from_millis(100));
            let mut last = Instant::now();
            while running.load(Ordering::SeqCst) {
                thread::sleep(slice);
                if last.elapsed() >= interval {
                    table.reap_expired();
                    last = Instant::now();
                }
            }
            debug!("[Peers] Reaper stopped");
        })
}
