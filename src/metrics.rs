//! Context-wide transfer rate meters.
//!
//! Connections report payload bytes as they move; the control loop ticks the
//! meters on a fixed interval and folds the accumulated count into an
//! exponentially weighted moving average, bytes per second.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use parking_lot::Mutex;

/// Smoothing factor; roughly a one-minute horizon at 5s ticks.
const ALPHA: f64 = 0.16;

#[derive(Clone, Default)]
pub struct Rate {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: AtomicU64,
    rate: Mutex<f64>,
}

impl Rate {
    pub fn add(&self, bytes: usize) {
        self.inner.pending.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Folds bytes accumulated since the last tick into the average.
    pub fn tick(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }

        let bytes = self.inner.pending.swap(0, Ordering::Relaxed) as f64;
        let mut rate = self.inner.rate.lock();
        *rate = ALPHA * (bytes / secs) + (1.0 - ALPHA) * *rate;
    }

    /// Bytes per second.
    pub fn get(&self) -> f64 {
        *self.inner.rate.lock()
    }
}

/// Up/down meter pair shared by every connection of a context.
#[derive(Clone, Default)]
pub struct Rates {
    pub up: Rate,
    pub down: Rate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_upward() {
        let rate = Rate::default();

        for _ in 0..60 {
            rate.add(5000);
            rate.tick(Duration::from_secs(5));
        }

        // steady 1000 B/s input; the average should be closing in on it
        let got = rate.get();
        assert!(got > 900.0 && got <= 1000.0, "rate was {}", got);
    }

    #[test]
    fn idle_decays() {
        let rate = Rate::default();
        rate.add(100_000);
        rate.tick(Duration::from_secs(1));
        let busy = rate.get();

        for _ in 0..20 {
            rate.tick(Duration::from_secs(5));
        }

        assert!(rate.get() < busy / 10.0);
    }
}
