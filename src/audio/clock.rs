//! Presentation clocks
//!
//! A clock extrapolates a stream's presentation time from the last
//! anchor `(pts, wall time)`. Each clock remembers the packet queue serial
//! it was anchored under and reads as NaN once that queue has been flushed
//! past it.

use crate::audio::sync::AV_NOSYNC_THRESHOLD;
use crate::utils::now_seconds;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: i32,
    paused: bool,
}

/// Drift-compensated presentation clock
pub struct Clock {
    state: Mutex<ClockState>,
    /// Live serial of the owning packet queue; `None` for the external
    /// clock, which is never stale
    queue_serial: Option<Arc<AtomicI32>>,
}

impl Clock {
    /// Create a clock tied to a packet queue serial, already initialised
    pub fn new(queue_serial: Option<Arc<AtomicI32>>) -> Self {
        let clock = Self {
            state: Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: 0.0,
                speed: 1.0,
                serial: -1,
                paused: false,
            }),
            queue_serial,
        };
        clock.init();
        clock
    }

    /// Speed 1, running, anchored at `(NaN, serial -1)`
    pub fn init(&self) {
        {
            let mut state = self.state.lock();
            state.speed = 1.0;
            state.paused = false;
        }
        self.set(f64::NAN, -1);
    }

    /// Current estimate in seconds, NaN if unknown or stale
    pub fn get(&self) -> f64 {
        let state = *self.state.lock();
        if self.is_stale(&state) {
            return f64::NAN;
        }
        if state.paused {
            state.pts
        } else {
            let time = now_seconds();
            state.pts_drift + time - (time - state.last_updated) * (1.0 - state.speed)
        }
    }

    fn is_stale(&self, state: &ClockState) -> bool {
        match &self.queue_serial {
            Some(serial) => serial.load(Ordering::Acquire) != state.serial,
            None => false,
        }
    }

    /// Anchor at `pts` for wall time `time`
    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        let mut state = self.state.lock();
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = serial;
    }

    /// Anchor at `pts` now
    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, now_seconds());
    }

    /// Change the rate after re-anchoring at the current estimate
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let serial = self.serial();
        self.set(current, serial);
        self.state.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn serial(&self) -> i32 {
        self.state.lock().serial
    }

    /// Last anchored pts, regardless of staleness
    pub fn pts(&self) -> f64 {
        self.state.lock().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }

    /// Re-anchor this clock on `slave` when it is unknown or has drifted
    /// beyond the no-sync threshold
    pub fn sync_to_slave(&self, slave: &Clock) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan() && (clock.is_nan() || (clock - slave_clock).abs() > AV_NOSYNC_THRESHOLD) {
            self.set(slave_clock, slave.serial());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::packet_queue::PacketQueue;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_init_reads_nan() {
        let clock = Clock::new(None);
        assert!(clock.get().is_nan());
        assert_eq!(clock.serial(), -1);
        assert_eq!(clock.speed(), 1.0);
    }

    #[test]
    fn test_clock_advances_with_wall_time() {
        let queue = PacketQueue::new();
        queue.start();
        let clock = Clock::new(Some(queue.serial_handle()));

        clock.set(10.0, queue.serial());
        thread::sleep(Duration::from_millis(30));
        let value = clock.get();
        assert!(value >= 10.02 && value < 10.5, "unexpected clock value {}", value);
    }

    #[test]
    fn test_paused_clock_is_frozen() {
        let clock = Clock::new(None);
        clock.set(3.0, 0);
        clock.set_paused(true);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.get(), 3.0);
    }

    #[test]
    fn test_stale_after_flush() {
        let queue = PacketQueue::new();
        queue.start();
        let clock = Clock::new(Some(queue.serial_handle()));

        clock.set(5.0, queue.serial());
        assert!(!clock.get().is_nan());

        queue.flush();
        assert!(clock.get().is_nan());
        assert_eq!(clock.pts(), 5.0);
    }

    #[test]
    fn test_set_speed_does_not_jump() {
        let clock = Clock::new(None);
        clock.set(1.0, 0);
        let before = clock.get();
        clock.set_speed(2.0);
        let after = clock.get();
        assert!((after - before).abs() < 0.01);
        assert_eq!(clock.speed(), 2.0);

        thread::sleep(Duration::from_millis(40));
        // twice as fast as wall time
        assert!(clock.get() - after >= 0.07);
    }

    #[test]
    fn test_sync_to_slave() {
        let master = Clock::new(None);
        let slave = Clock::new(None);

        slave.set(42.0, 7);
        master.sync_to_slave(&slave);
        assert!((master.get() - 42.0).abs() < 0.01);
        assert_eq!(master.serial(), 7);

        // small drift is left alone
        master.set(42.5, 7);
        master.sync_to_slave(&slave);
        assert!((master.get() - 42.5).abs() < 0.01);
    }
}
