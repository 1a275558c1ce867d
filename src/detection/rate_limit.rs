use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct RateCounter {
    count: u32,
    window_end: Instant,
}

impl RateCounter {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_end: now + RATE_WINDOW,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.window_end {
            *self = Self::new(now);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub count: u32,
    pub window_end: DateTime<Utc>,
}

/// Fixed one-minute window incident counter, one per camera.
pub struct RateLimiter {
    max_per_minute: u32,
    counters: Mutex<HashMap<String, RateCounter>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Admits and counts one incident if the camera is under its cap.
    pub fn allow(&self, camera_id: &str) -> bool {
        self.allow_at(camera_id, Instant::now())
    }

    pub fn allow_at(&self, camera_id: &str, now: Instant) -> bool {
        self.with_counter(camera_id, now, |counter, max| {
            if counter.count < max {
                counter.count += 1;
                true
            } else {
                false
            }
        })
    }

    /// Whether the camera is under its cap, without counting anything.
    pub fn has_capacity(&self, camera_id: &str) -> bool {
        self.has_capacity_at(camera_id, Instant::now())
    }

    pub fn has_capacity_at(&self, camera_id: &str, now: Instant) -> bool {
        self.with_counter(camera_id, now, |counter, max| counter.count < max)
    }

    /// Counts a confirmed delivery. Saturates at the cap.
    pub fn record(&self, camera_id: &str) -> bool {
        self.allow(camera_id)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CounterSnapshot> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        counters
            .iter()
            .map(|(id, counter)| {
                let remaining = counter.window_end.saturating_duration_since(now);
                let window_end = wall_now
                    + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
                (
                    id.clone(),
                    CounterSnapshot {
                        count: counter.count,
                        window_end,
                    },
                )
            })
            .collect()
    }

    fn with_counter<T>(
        &self,
        camera_id: &str,
        now: Instant,
        f: impl FnOnce(&mut RateCounter, u32) -> T,
    ) -> T {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters
            .entry(camera_id.to_string())
            .or_insert_with(|| RateCounter::new(now));
        counter.roll(now);
        f(counter, self.max_per_minute)
    }
}
