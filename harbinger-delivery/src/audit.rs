//! Per-recipient bounce rate limiting.
//!
//! A recipient gets at most `capacity` bounces per `interval` seconds; the
//! call that would exceed the cap is denied and no state is recorded for it.
//! Both knobs are tunable from the admin console at runtime.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Instant,
};

use dashmap::DashMap;

/// Windows are vacuumed once the table grows past this many recipients.
const TABLE_LIMIT: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
}

/// Fixed-window bounce limiter keyed by recipient address.
#[derive(Debug)]
pub struct BounceAudit {
    capacity: AtomicU32,
    interval: AtomicU64,
    windows: DashMap<String, Window>,
}

impl BounceAudit {
    #[must_use]
    pub fn new(capacity: u32, interval: u64) -> Self {
        Self {
            capacity: AtomicU32::new(capacity),
            interval: AtomicU64::new(interval),
            windows: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> u64 {
        self.interval.load(Ordering::Relaxed)
    }

    pub fn set_capacity(&self, capacity: u32) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn set_interval(&self, interval: u64) {
        self.interval.store(interval, Ordering::Relaxed);
    }

    /// Admit or deny one bounce to `recipient`, recording the admission.
    pub fn check(&self, recipient: &str) -> bool {
        let now = Instant::now();
        let interval = self.interval();
        let capacity = self.capacity();

        let mut entry = self
            .windows
            .entry(recipient.to_ascii_lowercase())
            .or_insert(Window {
                start: now,
                count: 0,
            });
        if now.duration_since(entry.start).as_secs() >= interval {
            entry.start = now;
            entry.count = 0;
        }
        if entry.count >= capacity {
            return false;
        }
        entry.count += 1;
        drop(entry);

        if self.windows.len() > TABLE_LIMIT {
            self.vacuum(now, interval);
        }
        true
    }

    fn vacuum(&self, now: Instant, interval: u64) {
        self.windows
            .retain(|_, window| now.duration_since(window.start).as_secs() < interval);
    }
}
