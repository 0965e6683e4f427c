//! Delivery outcome counters and the failure alarm.
//!
//! Counters are plain relaxed atomics read by the admin console. The alarm
//! tracks failures in a sliding window and emits a warning event when the
//! configured frequency is exceeded, spaced by at least `alarm_interval`.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct AlarmWindow {
    window_start: Option<Instant>,
    failures: u32,
    last_alarm: Option<Instant>,
}

/// Outcome counters plus failure-alarm state for the local delivery engine.
#[derive(Debug)]
pub struct DeliveryStats {
    ok: AtomicU64,
    temp: AtomicU64,
    permanent: AtomicU64,
    nouser: AtomicU64,

    statistic_times: AtomicU32,
    statistic_interval: AtomicU64,
    alarm_interval: AtomicU64,
    window: Mutex<AlarmWindow>,
}

impl DeliveryStats {
    /// `times` failures within `statistic_interval` seconds raise an alarm,
    /// at most once per `alarm_interval` seconds.
    #[must_use]
    pub fn new(times: u32, statistic_interval: u64, alarm_interval: u64) -> Self {
        Self {
            ok: AtomicU64::new(0),
            temp: AtomicU64::new(0),
            permanent: AtomicU64::new(0),
            nouser: AtomicU64::new(0),
            statistic_times: AtomicU32::new(times),
            statistic_interval: AtomicU64::new(statistic_interval),
            alarm_interval: AtomicU64::new(alarm_interval),
            window: Mutex::new(AlarmWindow::default()),
        }
    }

    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_temp(&self) {
        self.temp.fetch_add(1, Ordering::Relaxed);
        self.note_failure();
    }

    pub fn record_permanent(&self) {
        self.permanent.fetch_add(1, Ordering::Relaxed);
        self.note_failure();
    }

    pub fn record_nouser(&self) {
        self.nouser.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ok(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn temp(&self) -> u64 {
        self.temp.load(Ordering::Relaxed)
    }

    pub fn permanent(&self) -> u64 {
        self.permanent.load(Ordering::Relaxed)
    }

    pub fn nouser(&self) -> u64 {
        self.nouser.load(Ordering::Relaxed)
    }

    pub fn statistic_times(&self) -> u32 {
        self.statistic_times.load(Ordering::Relaxed)
    }

    pub fn statistic_interval(&self) -> u64 {
        self.statistic_interval.load(Ordering::Relaxed)
    }

    pub fn alarm_interval(&self) -> u64 {
        self.alarm_interval.load(Ordering::Relaxed)
    }

    pub fn set_alarm_frequency(&self, times: u32, interval: u64) {
        self.statistic_times.store(times, Ordering::Relaxed);
        self.statistic_interval.store(interval, Ordering::Relaxed);
    }

    pub fn set_alarm_interval(&self, interval: u64) {
        self.alarm_interval.store(interval, Ordering::Relaxed);
    }

    fn note_failure(&self) {
        let now = Instant::now();
        let interval = self.statistic_interval();
        let times = self.statistic_times();

        let mut window = self.window.lock();
        match window.window_start {
            Some(start) if now.duration_since(start).as_secs() < interval => {}
            _ => {
                window.window_start = Some(now);
                window.failures = 0;
            }
        }
        window.failures += 1;
        if window.failures < times {
            return;
        }

        let spaced = window.last_alarm.is_none_or(|last| {
            now.duration_since(last).as_secs() >= self.alarm_interval()
        });
        if spaced {
            tracing::warn!(
                failures = window.failures,
                interval_secs = interval,
                "delivery failure frequency exceeded"
            );
            window.last_alarm = Some(now);
        }
        window.window_start = Some(now);
        window.failures = 0;
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new(100, 3600, 1800)
    }
}
