//! Time source used for cache freshness and peer expiry.
//!
//! Two readings are exposed. `now()` is the wall clock, used only for
//! display. `ticks()` is monotonic and is what every age comparison uses,
//! because ptp4l and phc2sys step CLOCK_REALTIME. Tests drive a
//! [`ManualClock`] so windows can be crossed without sleeping.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time since an arbitrary, fixed origin.
    fn ticks(&self) -> Duration;
}

static ORIGIN: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Real wall clock backed by `Instant` for ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn ticks(&self) -> Duration {
        ORIGIN.elapsed()
    }
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    ticks: Duration,
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            state: Mutex::new(ManualState {
                wall: start,
                ticks: Duration::ZERO,
            }),
        }
    }

    /// Let real time pass: both readings move forward.
    pub fn advance(&self, by: Duration) {
        let step = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.wall += step;
        state.ticks += by;
    }

    /// Step only the wall clock, as a time daemon would. May go backwards.
    pub fn step_wall(&self, by: ChronoDuration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.wall += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).wall
    }

    fn ticks(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).ticks
    }
}

/// Monotonic age of something stamped at `since`.
pub fn age(clock: &dyn Clock, since: Duration) -> Duration {
    clock.ticks().saturating_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, ChronoDuration::seconds(90));
        assert_eq!(age(&clock, Duration::ZERO), Duration::from_secs(90));
    }

    #[test]
    fn test_wall_step_leaves_ticks_alone() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(10));
        clock.step_wall(ChronoDuration::hours(-1));

        assert_eq!(clock.now(), start - ChronoDuration::minutes(59) - ChronoDuration::seconds(50));
        assert_eq!(clock.ticks(), Duration::from_secs(10));
    }

    #[test]
    fn test_system_ticks_are_monotonic() {
        let clock = SystemClock;
        let a = clock.ticks();
        let b = clock.ticks();
        assert!(b >= a);
        assert!(clock.now().timestamp() > 1_577_836_800);
    }
}
