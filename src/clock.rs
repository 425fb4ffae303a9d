// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Monotonic/wall time helpers and the segment rotation clock

use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic clock in nanoseconds. This is the timebase of every
/// `log_mono_time` field written by the recorder.
pub fn mono_time_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // clock_gettime cannot fail for CLOCK_MONOTONIC with a valid pointer
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn mono_time_s() -> f64 {
    mono_time_ns() as f64 / 1e9
}

/// Wall clock in nanoseconds since the epoch (boot record only).
pub fn wall_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Fixed-cadence rotation schedule, phase-preserving.
///
/// A missed tick (the ingest loop stalled past a boundary) advances the
/// schedule by exactly one interval from the previous boundary, not from
/// "now", so later boundaries stay aligned to process start.
#[derive(Debug)]
pub struct SegmentClock {
    interval_s: f64,
    last_rotate_s: f64,
}

impl SegmentClock {
    pub fn new(interval_s: f64, start_s: f64) -> Self {
        Self {
            interval_s,
            last_rotate_s: start_s,
        }
    }

    /// True once per elapsed interval boundary.
    pub fn tick(&mut self, now_s: f64) -> bool {
        if now_s - self.last_rotate_s > self.interval_s {
            self.last_rotate_s += self.interval_s;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tick_before_boundary() {
        let mut clock = SegmentClock::new(60.0, 100.0);
        assert!(!clock.tick(100.0));
        assert!(!clock.tick(159.9));
    }

    #[test]
    fn test_tick_after_boundary() {
        let mut clock = SegmentClock::new(60.0, 100.0);
        assert!(clock.tick(160.1));
        assert!(!clock.tick(160.2));
        assert!(clock.tick(220.1));
    }

    #[test]
    fn test_phase_preserved_across_missed_ticks() {
        let mut clock = SegmentClock::new(60.0, 0.0);
        // stall for 2.5 intervals: each tick() call advances one boundary
        assert!(clock.tick(150.0));
        assert!(clock.tick(150.0));
        assert!(!clock.tick(150.0));
        // next boundary is 180, still phase-aligned to start
        assert!(!clock.tick(179.0));
        assert!(clock.tick(181.0));
    }

    #[test]
    fn test_mono_time_advances() {
        let a = mono_time_ns();
        let b = mono_time_ns();
        assert!(b >= a);
    }
}
