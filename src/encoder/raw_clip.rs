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

//! Lossless raw clips: short zstd-compressed recordings of the unencoded
//! rear camera stream, taken at random intervals alongside the lossy main
//! stream. One clip is [`RAW_CLIP_LENGTH`] frames; the next starts between
//! [`RAW_CLIP_MIN_INTERVAL_S`] and [`RAW_CLIP_MAX_INTERVAL_S`] seconds
//! after the previous one ends.

use crate::vision::YuvFrame;
use anyhow::{Context, Result};
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// 5 seconds at 20 fps.
pub const RAW_CLIP_LENGTH: usize = 100;
pub const RAW_CLIP_MIN_INTERVAL_S: f64 = 61.0;
pub const RAW_CLIP_MAX_INTERVAL_S: f64 = 480.0;

const CLIP_FILE: &str = "rawclip.zst";

fn next_interval_s() -> f64 {
    rand::thread_rng().gen_range(RAW_CLIP_MIN_INTERVAL_S..RAW_CLIP_MAX_INTERVAL_S)
}

type ClipEncoder = zstd::stream::write::AutoFinishEncoder<'static, BufWriter<File>>;

/// Clip recorder for one camera. Rotates with the main codec; each clip is
/// an independent zstd stream appended to the segment's clip file, so a
/// segment with several clips still decodes as one concatenation.
pub struct RawClipLogger {
    dir: Option<PathBuf>,
    segment_num: i32,
    segment_id: i32,
    encoder: Option<ClipEncoder>,
    clip_frames: usize,
    next_clip_start_s: f64,
}

impl RawClipLogger {
    /// `now_s` schedules the first clip: never within the first interval
    /// after startup.
    pub fn new(now_s: f64) -> Self {
        Self {
            dir: None,
            segment_num: -1,
            segment_id: 0,
            encoder: None,
            clip_frames: 0,
            next_clip_start_s: now_s + next_interval_s(),
        }
    }

    /// Follow the main codec into a new segment. A clip spanning the
    /// rotation continues in the new segment's file.
    pub fn rotate(&mut self, path: &Path, segment: i32) -> Result<()> {
        self.end_stream()?;
        self.dir = Some(path.to_path_buf());
        self.segment_num = segment;
        self.segment_id = 0;
        Ok(())
    }

    /// True when a clip is in progress or due to start.
    pub fn due(&self, now_s: f64) -> bool {
        self.encoder.is_some() || now_s > self.next_clip_start_s
    }

    /// Record one frame into the current clip, opening it if needed.
    /// Returns the `(segment_num, segment_id)` of the stored frame, or
    /// `None` when no segment exists yet.
    pub fn log_frame(&mut self, frame: &YuvFrame, now_s: f64) -> Result<Option<(i32, i32)>> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(None);
        };

        if self.encoder.is_none() {
            let path = dir.join(CLIP_FILE);
            let file = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            );
            let encoder = zstd::stream::write::Encoder::new(file, zstd::DEFAULT_COMPRESSION_LEVEL)
                .context("failed to start clip compressor")?
                .auto_finish();
            self.encoder = Some(encoder);
            self.clip_frames = 0;
            info!("starting raw clip in segment {}", self.segment_num);
        }

        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(None);
        };
        encoder.write_all(&(frame.data.len() as u32).to_le_bytes())?;
        encoder.write_all(&frame.data)?;

        let stored = (self.segment_num, self.segment_id);
        self.segment_id += 1;
        self.clip_frames += 1;

        if self.clip_frames >= RAW_CLIP_LENGTH {
            self.end_stream()?;
            self.next_clip_start_s = now_s + next_interval_s();
            info!(
                "ending raw clip in segment {}, next in {:.1} sec",
                stored.0,
                self.next_clip_start_s - now_s
            );
        }
        Ok(Some(stored))
    }

    pub fn close(&mut self) -> Result<()> {
        self.end_stream()
    }

    fn end_stream(&mut self) -> Result<()> {
        // dropping the encoder finishes the zstd stream
        self.encoder = None;
        self.clip_frames = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn frame() -> YuvFrame {
        YuvFrame {
            data: Bytes::from(vec![9u8; 24]),
        }
    }

    #[test]
    fn test_first_clip_not_before_first_interval() {
        let clips = RawClipLogger::new(100.0);
        assert!(!clips.due(100.0));
        assert!(!clips.due(100.0 + RAW_CLIP_MIN_INTERVAL_S - 0.5));
        assert!(clips.due(100.0 + RAW_CLIP_MAX_INTERVAL_S + 0.1));
    }

    #[test]
    fn test_no_frames_before_first_rotation() {
        let mut clips = RawClipLogger::new(0.0);
        assert_eq!(clips.log_frame(&frame(), 1000.0).unwrap(), None);
    }

    #[test]
    fn test_clip_closes_after_bounded_length() {
        let dir = TempDir::new().unwrap();
        let seg = dir.path().join("0");
        std::fs::create_dir_all(&seg).unwrap();

        let mut clips = RawClipLogger::new(0.0);
        clips.rotate(&seg, 0).unwrap();
        for i in 0..RAW_CLIP_LENGTH {
            let stored = clips.log_frame(&frame(), 1000.0).unwrap().unwrap();
            assert_eq!(stored, (0, i as i32));
        }
        // clip ended: not due again until the next random interval
        assert!(!clips.due(1000.0 + RAW_CLIP_MIN_INTERVAL_S - 1.0));
        assert!(clips.next_clip_start_s >= 1000.0 + RAW_CLIP_MIN_INTERVAL_S);
        assert!(seg.join(CLIP_FILE).exists());
    }

    #[test]
    fn test_segment_id_restarts_on_rotate() {
        let dir = TempDir::new().unwrap();
        let seg0 = dir.path().join("0");
        let seg1 = dir.path().join("1");
        std::fs::create_dir_all(&seg0).unwrap();
        std::fs::create_dir_all(&seg1).unwrap();

        let mut clips = RawClipLogger::new(0.0);
        clips.rotate(&seg0, 0).unwrap();
        assert_eq!(clips.log_frame(&frame(), 10.0).unwrap(), Some((0, 0)));
        assert_eq!(clips.log_frame(&frame(), 10.0).unwrap(), Some((0, 1)));
        clips.rotate(&seg1, 1).unwrap();
        assert_eq!(clips.log_frame(&frame(), 10.0).unwrap(), Some((1, 0)));
        clips.close().unwrap();
    }
}
