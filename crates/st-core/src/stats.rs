//! Duration statistics kept per subsystem for observation.

use parking_lot::Mutex;

/// Running count / mean / extremes of an observed quantity, typically the
/// processing duration of one command or packet in milliseconds.
pub struct Stats {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    count: u64,
    total: f64,
    lowest: f64,
    highest: f64,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                count: 0,
                total: 0.0,
                lowest: 0.0,
                highest: 0.0,
            }),
        }
    }

    pub fn trigger(&self, value: f64) {
        let mut inner = self.inner.lock();
        if inner.count == 0 || value < inner.lowest {
            inner.lowest = value;
        }
        if value > inner.highest {
            inner.highest = value;
        }
        inner.count += 1;
        inner.total += value;
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Render as "low/mean/high@count" with the given unit divisor.
    pub fn format(&self, divisor: f64) -> String {
        let inner = self.inner.lock();
        let mean = if inner.count == 0 {
            0.0
        } else {
            inner.total / inner.count as f64
        };
        format!(
            "{:.1}/{:.1}/{:.1}@{}",
            inner.lowest / divisor,
            mean / divisor,
            inner.highest / divisor,
            inner.count
        )
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
