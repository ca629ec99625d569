//! Short-lived memoization in front of the status builder.
//!
//! Bounds how often pmc/pgrep/ethtool get spawned while a UI polls rapidly.
//! The lock is held across a rebuild, so concurrent callers that miss the
//! window wait for the one rebuild in flight instead of starting their own.

use crate::clock::{age, Clock};
use crate::status::{SnapshotSource, StatusSnapshot};
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Entry {
    built_at: Duration,
    snapshot: Arc<StatusSnapshot>,
}

pub struct StatusCache<S: SnapshotSource> {
    source: S,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    entry: Mutex<Option<Entry>>,
}

impl<S: SnapshotSource> StatusCache<S> {
    pub fn new(source: S, clock: Arc<dyn Clock>, freshness: Duration) -> Self {
        StatusCache {
            source,
            clock,
            freshness,
            entry: Mutex::new(None),
        }
    }

    pub fn get_or_build(&self) -> Arc<StatusSnapshot> {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(cached) = entry.as_ref() {
            if age(self.clock.as_ref(), cached.built_at) < self.freshness {
                return cached.snapshot.clone();
            }
        }

        debug!("[Status] Cache miss, rebuilding snapshot");
        let snapshot = Arc::new(self.source.build());
        *entry = Some(Entry {
            built_at: self.clock.ticks(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ptp::PortState;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        builds: Arc<AtomicUsize>,
    }

    impl SnapshotSource for CountingSource {
        fn build(&self) -> StatusSnapshot {
            let n = self.builds.fetch_add(1, Ordering::SeqCst);
            StatusSnapshot {
                ptp_daemon_running: true,
                port_state: PortState::Slave,
                offset_ns: n as f64,
                ..StatusSnapshot::default()
            }
        }
    }

    fn setup() -> (StatusCache<CountingSource>, Arc<ManualClock>, Arc<AtomicUsize>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = StatusCache::new(
            CountingSource { builds: builds.clone() },
            clock.clone(),
            Duration::from_secs(1),
        );
        (cache, clock, builds)
    }

    #[test]
    fn test_hit_within_window_is_identical() {
        let (cache, clock, builds) = setup();
        let first = cache.get_or_build();
        clock.advance(Duration::from_millis(900));
        let second = cache.get_or_build();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(
            serde_json::to_vec(&*first).unwrap(),
            serde_json::to_vec(&*second).unwrap()
        );
    }

    #[test]
    fn test_expired_window_rebuilds_once() {
        let (cache, clock, builds) = setup();
        cache.get_or_build();
        clock.advance(Duration::from_millis(1_001));

        let rebuilt = cache.get_or_build();
        let again = cache.get_or_build();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(rebuilt.offset_ns, 1.0);
        assert!(Arc::ptr_eq(&rebuilt, &again));
    }

    #[test]
    fn test_wall_clock_step_back_does_not_pin_snapshot() {
        let (cache, clock, builds) = setup();
        cache.get_or_build();
        clock.step_wall(ChronoDuration::hours(-1));

        for _ in 0..10 {
            clock.advance(Duration::from_secs(5));
            cache.get_or_build();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_wall_clock_step_forward_does_not_expire_early() {
        let (cache, clock, builds) = setup();
        cache.get_or_build();
        clock.step_wall(ChronoDuration::hours(2));
        cache.get_or_build();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_misses_share_one_rebuild() {
        let (cache, _clock, builds) = setup();
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = cache.clone();
                std::thread::spawn(move || c.get_or_build())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
