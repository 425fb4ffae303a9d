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

//! Rotation coordinator: the single piece of state shared between the
//! ingest loop and the encoder workers.
//!
//! The ingest loop is the timing authority. It records the newest rear
//! camera `frame_id` it has ingested and, on each segment tick, advances
//! the rotation target. Encoder workers observe that state and rotate at a
//! frame-aligned boundary so every encode-index record lands in the same
//! segment as its ingest-side frame event.

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// If the encoder's frame id is ahead of ingest by this much or more, the
/// frame counter has jumped (camera process restarted) and waiting for
/// ingest to catch up would block forever.
pub const FRAME_GAP: u32 = 8;

#[derive(Debug, Default)]
struct RotationState {
    segment_path: PathBuf,
    /// Highest rear-camera frame id seen by ingest.
    last_frame_id: u32,
    /// `last_frame_id` snapshot taken when the latest rotation triggered.
    rotate_last_frame_id: u32,
    /// Segment the encoders should move into. -1 until the first segment
    /// exists (only-stream mode never advances it).
    rotate_segment: i32,
}

pub struct Coordinator {
    state: Mutex<RotationState>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// Rotation instruction handed to an encoder worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateTo {
    pub segment: i32,
    pub path: PathBuf,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RotationState {
                rotate_segment: -1,
                ..Default::default()
            }),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Record the newest rear-camera frame id ingested. Ingest loop only.
    pub fn observe_frame(&self, frame_id: u32) {
        let mut state = self.state.lock();
        state.last_frame_id = frame_id;
        drop(state);
        self.cv.notify_all();
    }

    /// Advance to a new segment. Ingest loop only.
    ///
    /// `next` is the logger's `next_segment`; it runs under the lock so
    /// segment creation is serialised against encoder rotation, and the
    /// frame-id snapshot is taken before the new segment number becomes
    /// visible.
    pub fn advance_segment_with<F>(&self, next: F) -> Result<(i32, PathBuf)>
    where
        F: FnOnce() -> Result<(i32, PathBuf)>,
    {
        let mut state = self.state.lock();
        state.rotate_last_frame_id = state.last_frame_id;
        let (seg, path) = next()?;
        state.segment_path = path.clone();
        state.rotate_segment = seg;
        drop(state);
        self.cv.notify_all();
        Ok((seg, path))
    }

    /// Per-frame synchronisation point for encoder workers.
    ///
    /// Rear camera: first blocks while ingest lags this frame
    /// (`frame_id > last_frame_id`), the gap is below [`FRAME_GAP`], and no
    /// shutdown is pending; then rotates only once the frame is past the
    /// rotation snapshot. Front camera: best effort, rotates whenever a
    /// newer segment exists.
    ///
    /// When a rotation is due, `rotate` runs with the coordinator still
    /// locked; the worker swaps its codec, clip logger, and writer handle
    /// inside it. Returns the segment the worker is now encoding into.
    pub fn encoder_sync<F>(
        &self,
        is_front: bool,
        encoder_segment: i32,
        frame_id: u32,
        rotate: F,
    ) -> Result<i32>
    where
        F: FnOnce(&RotateTo) -> Result<()>,
    {
        let mut state = self.state.lock();

        if !is_front {
            while frame_id > state.last_frame_id
                && frame_id - state.last_frame_id < FRAME_GAP
                && !self.shutdown.load(Ordering::Acquire)
            {
                self.cv.wait(&mut state);
            }
        }

        if self.shutdown.load(Ordering::Acquire) {
            return Ok(encoder_segment);
        }

        let should_rotate = if is_front {
            encoder_segment < state.rotate_segment
        } else {
            frame_id > state.rotate_last_frame_id && encoder_segment < state.rotate_segment
        };

        if should_rotate {
            let target = RotateTo {
                segment: state.rotate_segment,
                path: state.segment_path.clone(),
            };
            rotate(&target)?;
            return Ok(target.segment);
        }

        Ok(encoder_segment)
    }

    /// Set the shutdown flag and wake every waiter.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of (last_frame_id, rotate_last_frame_id, rotate_segment).
    pub fn snapshot(&self) -> (u32, u32, i32) {
        let state = self.state.lock();
        (
            state.last_frame_id,
            state.rotate_last_frame_id,
            state.rotate_segment,
        )
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn advance(c: &Coordinator, seg: i32, path: &str) {
        c.advance_segment_with(|| Ok((seg, PathBuf::from(path))))
            .unwrap();
    }

    #[test]
    fn test_snapshot_taken_before_segment_advances() {
        let c = Coordinator::new();
        c.observe_frame(41);
        advance(&c, 0, "/seg/0");
        let (last, rotate_last, seg) = c.snapshot();
        assert_eq!((last, rotate_last, seg), (41, 41, 0));
    }

    #[test]
    fn test_front_rotates_without_frame_condition() {
        let c = Coordinator::new();
        advance(&c, 0, "/seg/0");
        let mut rotated = None;
        let seg = c
            .encoder_sync(true, -1, 0, |t| {
                rotated = Some(t.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(seg, 0);
        assert_eq!(rotated.unwrap().path, Path::new("/seg/0"));
    }

    #[test]
    fn test_rear_does_not_rotate_behind_snapshot() {
        let c = Coordinator::new();
        c.observe_frame(100);
        advance(&c, 1, "/seg/1");
        // frame 100 was already counted into the previous segment
        let seg = c
            .encoder_sync(false, 0, 100, |_| panic!("must not rotate"))
            .unwrap();
        assert_eq!(seg, 0);
        // the next frame crosses the boundary
        c.observe_frame(101);
        let seg = c.encoder_sync(false, 0, 101, |_| Ok(())).unwrap();
        assert_eq!(seg, 1);
    }

    #[test]
    fn test_rear_waits_for_ingest_then_proceeds() {
        let c = Arc::new(Coordinator::new());
        c.observe_frame(45);
        advance(&c, 0, "/seg/0");

        let c2 = Arc::clone(&c);
        let worker = std::thread::spawn(move || {
            // frame 50 with ingest at 45: gap 5 < 8, so this blocks until
            // ingest catches up
            c2.encoder_sync(false, 0, 50, |_| Ok(())).unwrap()
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        c.observe_frame(50);
        assert_eq!(worker.join().unwrap(), 0);
    }

    #[test]
    fn test_discontinuity_gap_bypasses_wait() {
        let c = Coordinator::new();
        c.observe_frame(45);
        advance(&c, 0, "/seg/0");
        // gap of 9955 frames: camera restarted, do not wait
        let seg = c.encoder_sync(false, 0, 10_000, |_| panic!("no rotation due")).unwrap();
        assert_eq!(seg, 0);
    }

    #[test]
    fn test_shutdown_wakes_waiting_encoder() {
        let c = Arc::new(Coordinator::new());
        c.observe_frame(45);

        let c2 = Arc::clone(&c);
        let worker =
            std::thread::spawn(move || c2.encoder_sync(false, -1, 50, |_| Ok(())).unwrap());

        std::thread::sleep(Duration::from_millis(50));
        c.shutdown();
        // returns with its segment unchanged
        assert_eq!(worker.join().unwrap(), -1);
    }

    #[test]
    fn test_rotate_segment_monotonic() {
        let c = Coordinator::new();
        for seg in 0..5 {
            advance(&c, seg, "/seg");
            let (_, _, rotate_segment) = c.snapshot();
            assert_eq!(rotate_segment, seg);
        }
    }
}
