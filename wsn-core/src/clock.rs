//! C9: Timebase & Tickers.
//!
//! The engine measures every timeout against a strictly monotonic clock and
//! never against wall-clock time directly. Unix time is only ever derived
//! by adding a settable offset to the monotonic reading taken when that
//! offset was last set.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic clock plus a mutable Unix-epoch offset, consumed by the
/// engine. Implementations on real hardware (ESP32 `esp_timer_get_time`,
/// Linux `CLOCK_MONOTONIC` via `bluer`'s host) must guarantee
/// monotonicity; the engine's liveness and hysteresis invariants depend on
/// time never going backwards.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary, fixed epoch (process start or
    /// device boot). Must never decrease.
    fn now_us(&self) -> u64;

    /// Milliseconds since the same epoch as [`Clock::now_us`].
    fn now_ms(&self) -> u64 {
        self.now_us() / 1_000
    }

    /// Set the Unix-epoch offset: `unix_time_ms() == offset + elapsed`
    /// from this point forward. Intended to be called once, from a
    /// trusted channel (e.g. NTP sync, BLE GATT time-set characteristic).
    fn set_unix_offset_ms(&self, unix_now_ms: i64);

    /// Current Unix time in milliseconds, or `None` if the offset was
    /// never set.
    fn unix_time_ms(&self) -> Option<i64>;
}

/// Default host/embedded-std implementation backed by [`std::time::Instant`].
pub struct SystemClock {
    start: Instant,
    offset_ms: AtomicI64,
    offset_set_at_us: AtomicU64,
    offset_is_set: std::sync::atomic::AtomicBool,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset_ms: AtomicI64::new(0),
            offset_set_at_us: AtomicU64::new(0),
            offset_is_set: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn set_unix_offset_ms(&self, unix_now_ms: i64) {
        let now_ms = self.now_ms();
        self.offset_ms
            .store(unix_now_ms - now_ms as i64, Ordering::SeqCst);
        self.offset_set_at_us.store(self.now_us(), Ordering::SeqCst);
        self.offset_is_set.store(true, Ordering::SeqCst);
    }

    fn unix_time_ms(&self) -> Option<i64> {
        if !self.offset_is_set.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.offset_ms.load(Ordering::SeqCst) + self.now_ms() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }

    #[test]
    fn unix_time_unset_until_offset_set() {
        let clock = SystemClock::new();
        assert_eq!(clock.unix_time_ms(), None);
        clock.set_unix_offset_ms(1_700_000_000_000);
        let t = clock.unix_time_ms().unwrap();
        assert!(t >= 1_700_000_000_000);
    }
}
