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

//! Ingest loop: the recorder's timing authority.
//!
//! A single thread polls every subscription, drains ready sockets to
//! empty, stamps and logs each message, and rotates the segmented log on
//! the wall-clock cadence. It is the only component allowed to call
//! `next_segment`.

use crate::bus::{poll_readable, BusSocket};
use crate::clock::{mono_time_ns, mono_time_s, SegmentClock};
use crate::coordinator::Coordinator;
use crate::events;
use crate::logger::Logger;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

const POLL_TIMEOUT_MS: i32 = 100;
const STATS_EVERY: u64 = 1000;

/// One subscribed topic with its quicklog sampling state.
pub struct Subscription {
    pub socket: Box<dyn BusSocket>,
    pub name: String,
    /// The designated camera frame topic: ingest extracts `frame_id` from
    /// its events to drive encoder synchronisation.
    pub is_frame: bool,
    /// Producer runs on a clock-skewed remote host; overwrite the event
    /// timestamp with the local receive time.
    pub patch_timestamp: bool,
    /// Quicklog frequency: mark every k-th message. 0 = never.
    pub qlog_freq: i32,
    qlog_counter: i32,
}

impl Subscription {
    pub fn new(
        socket: Box<dyn BusSocket>,
        name: impl Into<String>,
        is_frame: bool,
        patch_timestamp: bool,
        qlog_freq: i32,
    ) -> Self {
        Self {
            socket,
            name: name.into(),
            is_frame,
            patch_timestamp,
            qlog_freq,
            // -1 sentinel: never sampled into the quicklog
            qlog_counter: if qlog_freq > 0 { 0 } else { -1 },
        }
    }
}

pub struct IngestLoop {
    subs: Vec<Subscription>,
    logger: Arc<Logger>,
    coordinator: Arc<Coordinator>,
    clock: SegmentClock,
    /// False in only-stream mode: the clock still runs but no segments are
    /// created.
    is_logging: bool,
    msg_count: u64,
    bytes_count: u64,
    start_s: f64,
}

impl IngestLoop {
    pub fn new(
        subs: Vec<Subscription>,
        logger: Arc<Logger>,
        coordinator: Arc<Coordinator>,
        segment_length_s: f64,
        is_logging: bool,
    ) -> Self {
        let start_s = mono_time_s();
        Self {
            subs,
            logger,
            coordinator,
            clock: SegmentClock::new(segment_length_s, start_s),
            is_logging,
            msg_count: 0,
            bytes_count: 0,
            start_s,
        }
    }

    /// Poll, drain, log, rotate, until shutdown.
    pub fn run(&mut self) -> Result<()> {
        while !self.coordinator.is_shutdown() {
            self.iteration()?;
        }
        Ok(())
    }

    /// One poll/drain/rotate cycle. Exposed so tests can drive the loop
    /// deterministically.
    pub fn iteration(&mut self) -> Result<()> {
        let fds: Vec<_> = self.subs.iter().map(|s| s.socket.poll_fd()).collect();
        let ready = poll_readable(&fds, POLL_TIMEOUT_MS);

        for i in 0..self.subs.len() {
            // disconnected sockets get a drain pass too: try_recv drives
            // their reconnect back-off
            if ready[i] || fds[i].is_none() {
                self.drain(i)?;
            }
        }

        if self.clock.tick(mono_time_s()) {
            self.rotate()?;
        }

        if self.msg_count > 0 && self.msg_count % STATS_EVERY == 0 {
            let elapsed = (mono_time_s() - self.start_s).max(f64::EPSILON);
            debug!(
                "{} messages, {:.2} msg/sec, {:.2} KB/sec",
                self.msg_count,
                self.msg_count as f64 / elapsed,
                self.bytes_count as f64 * 0.001 / elapsed
            );
        }
        Ok(())
    }

    /// Messages processed so far.
    pub fn message_count(&self) -> u64 {
        self.msg_count
    }

    /// Open the next segment and publish it to the encoders. No-op in
    /// only-stream mode (the tick is consumed to keep the phase).
    pub fn rotate(&mut self) -> Result<()> {
        if !self.is_logging {
            return Ok(());
        }
        let logger = Arc::clone(&self.logger);
        let (seg, path) = self
            .coordinator
            .advance_segment_with(|| logger.next_segment())?;
        info!("rotated to {} (segment {})", path.display(), seg);
        Ok(())
    }

    fn drain(&mut self, i: usize) -> Result<()> {
        loop {
            let msg = match self.subs[i].socket.try_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("{}: recv failed: {}", self.subs[i].name, e);
                    return Ok(());
                }
            };
            self.process(i, msg)?;
        }
    }

    fn process(&mut self, i: usize, mut data: Vec<u8>) -> Result<()> {
        let sub = &mut self.subs[i];

        if sub.is_frame {
            match events::frame_id(&data) {
                Some(frame_id) => self.coordinator.observe_frame(frame_id),
                None => debug!("{}: frame event too short ({} bytes)", sub.name, data.len()),
            }
        }

        if sub.patch_timestamp {
            if let Err(e) = events::patch_mono_time(&mut data, mono_time_ns()) {
                warn!("{}: {}", sub.name, e);
            }
        }

        let qlog = sub.qlog_counter == 0;
        self.logger.log(&data, qlog)?;

        if sub.qlog_counter != -1 {
            sub.qlog_counter = (sub.qlog_counter + 1) % sub.qlog_freq;
        }

        self.msg_count += 1;
        self.bytes_count += data.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::read_log;
    use std::collections::VecDeque;
    use std::os::fd::RawFd;
    use tempfile::TempDir;

    /// Scripted in-memory bus socket.
    struct ScriptedSocket {
        queue: VecDeque<Vec<u8>>,
    }

    impl ScriptedSocket {
        fn new(msgs: Vec<Vec<u8>>) -> Self {
            Self {
                queue: msgs.into(),
            }
        }
    }

    impl BusSocket for ScriptedSocket {
        fn poll_fd(&self) -> Option<RawFd> {
            None
        }
        fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.queue.pop_front())
        }
    }

    fn setup(subs: Vec<Subscription>) -> (IngestLoop, Arc<Coordinator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let logger = Arc::new(Logger::new(dir.path(), "rlog", Vec::new(), true).unwrap());
        let coordinator = Arc::new(Coordinator::new());
        let ingest = IngestLoop::new(subs, logger, Arc::clone(&coordinator), 60.0, true);
        (ingest, coordinator, dir)
    }

    #[test]
    fn test_quicklog_marks_every_kth_starting_at_zero() {
        let msgs: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
        let sub = Subscription::new(
            Box::new(ScriptedSocket::new(msgs)),
            "sensor",
            false,
            false,
            3,
        );
        let (mut ingest, _c, dir) = setup(vec![sub]);
        ingest.rotate().unwrap();
        ingest.drain(0).unwrap();
        ingest.logger.close();

        let qlog = crate::logger::read_qlog(dir.path().join("0").join("qlog.zst")).unwrap();
        let marked: Vec<u8> = qlog.iter().map(|m| m[0]).collect();
        assert_eq!(marked, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_quicklog_freq_zero_never_marks() {
        let msgs: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();
        let sub = Subscription::new(
            Box::new(ScriptedSocket::new(msgs)),
            "chatty",
            false,
            false,
            0,
        );
        let (mut ingest, _c, dir) = setup(vec![sub]);
        ingest.rotate().unwrap();
        ingest.drain(0).unwrap();
        ingest.logger.close();

        assert_eq!(read_log(dir.path().join("0").join("rlog")).unwrap().len(), 5);
        let qlog = crate::logger::read_qlog(dir.path().join("0").join("qlog.zst")).unwrap();
        assert!(qlog.is_empty());
    }

    #[test]
    fn test_frame_topic_drives_coordinator() {
        let frames = vec![
            events::build_frame_event(7, 0),
            events::build_frame_event(8, 0),
        ];
        let sub = Subscription::new(Box::new(ScriptedSocket::new(frames)), "frame", true, false, 0);
        let (mut ingest, coordinator, _dir) = setup(vec![sub]);
        ingest.rotate().unwrap();
        ingest.drain(0).unwrap();
        assert_eq!(coordinator.snapshot().0, 8);
    }

    #[test]
    fn test_timestamp_patch_applied_to_remote_topics() {
        let before = mono_time_ns();
        let ev = events::build_event(events::EventKind::CameraFrame, 1, b"remote");
        let sub = Subscription::new(
            Box::new(ScriptedSocket::new(vec![ev])),
            "remote_sensor",
            false,
            true,
            0,
        );
        let (mut ingest, _c, dir) = setup(vec![sub]);
        ingest.rotate().unwrap();
        ingest.drain(0).unwrap();
        ingest.logger.close();

        let log = read_log(dir.path().join("0").join("rlog")).unwrap();
        let patched = events::log_mono_time(&log[0]).unwrap();
        assert!(patched >= before);
        assert!(patched <= mono_time_ns());
    }

    #[test]
    fn test_repeated_rotation_without_traffic() {
        let (mut ingest, coordinator, dir) = setup(vec![]);
        for expected in 0..3 {
            ingest.rotate().unwrap();
            assert_eq!(coordinator.snapshot().2, expected);
        }
        ingest.logger.close();
        for seg in 0..3 {
            let log = read_log(dir.path().join(seg.to_string()).join("rlog")).unwrap();
            assert!(log.is_empty());
        }
    }
}
