//! Store time.
//!
//! Expiration times and output timestamps are absolute store times, in seconds since the Unix
//! epoch. They are taken from a [`Clock`] so that expiry can be exercised without waiting.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use chrono::Utc;

pub trait Clock: Debug + Send + Sync + 'static {
    /// The current store time in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.
    }
}

/// A clock that only moves when told to.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<Mutex<f64>>);

impl ManualClock {
    pub fn new(now: f64) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub fn set(&self, now: f64) {
        if let Ok(mut time) = self.0.lock() {
            *time = now;
        }
    }

    pub fn advance(&self, seconds: f64) {
        if let Ok(mut time) = self.0.lock() {
            *time += seconds;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.0.lock().map(|time| *time).unwrap_or_default()
    }
}
