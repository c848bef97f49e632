// SPDX-License-Identifier: MIT
//! Sliding-window rate limiter: one window per client address, one
//! per device key, each checked against a per-minute count and a ten-second
//! burst count.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(10);
const CLEANUP_EVERY: u64 = 100;

/// An ordered deque of admit timestamps within the trailing one-minute
/// window for a single identifier.
struct SlidingWindow {
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new() -> Self {
        SlidingWindow {
            timestamps: VecDeque::new(),
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) > WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_in(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= window)
            .count()
    }

    fn push(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }
}

struct Windows {
    by_address: HashMap<String, SlidingWindow>,
    by_device: HashMap<String, SlidingWindow>,
}

pub struct RateLimiter {
    per_minute_limit: usize,
    burst_limit: usize,
    windows: Mutex<Windows>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(per_minute_limit: u32, burst_limit: u32) -> Self {
        RateLimiter {
            per_minute_limit: per_minute_limit as usize,
            burst_limit: burst_limit as usize,
            windows: Mutex::new(Windows {
                by_address: HashMap::new(),
                by_device: HashMap::new(),
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit or reject one request from `address`/`device_key`.
    pub fn allow(&self, address: &str, device_key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");

        let address_window = windows
            .by_address
            .entry(address.to_string())
            .or_insert_with(SlidingWindow::new);
        address_window.evict_stale(now);

        let device_window = windows
            .by_device
            .entry(device_key.to_string())
            .or_insert_with(SlidingWindow::new);
        device_window.evict_stale(now);

        let address_minute = windows.by_address[address].count_in(now, WINDOW);
        let device_minute = windows.by_device[device_key].count_in(now, WINDOW);
        if address_minute >= self.per_minute_limit || device_minute >= self.per_minute_limit {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let address_burst = windows.by_address[address].count_in(now, BURST_WINDOW);
        let device_burst = windows.by_device[device_key].count_in(now, BURST_WINDOW);
        if address_burst >= self.burst_limit || device_burst >= self.burst_limit {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        windows.by_address.get_mut(address).unwrap().push(now);
        windows.by_device.get_mut(device_key).unwrap().push(now);

        let admitted = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        if admitted % CLEANUP_EVERY == 0 {
            self.cleanup(&mut windows, now);
        }
        true
    }

    /// Evict deques that are empty after pruning, bounding memory.
    fn cleanup(&self, windows: &mut Windows, now: Instant) {
        windows.by_address.retain(|_, w| {
            w.evict_stale(now);
            !w.timestamps.is_empty()
        });
        windows.by_device.retain(|_, w| {
            w.evict_stale(now);
            !w.timestamps.is_empty()
        });
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Percentage of requests rejected out of all requests seen so far.
    pub fn block_rate(&self) -> f64 {
        let admitted = self.admitted() as f64;
        let rejected = self.rejected() as f64;
        let total = admitted + rejected;
        if total == 0.0 {
            0.0
        } else {
            (rejected / total) * 100.0
        }
    }
}
