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

//! Codec seam for the encoder workers.
//!
//! The real hardware codec lives outside this crate; workers drive it
//! through [`FrameCodec`]: rotate into a segment directory, encode frames
//! into it, close. `encode` reports which segment the chunk landed in and
//! its index within that segment, which is what keeps the encode-index
//! records truthful across rotations.

use crate::vision::{FrameExtra, StreamInfo, YuvFrame};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Result of encoding one frame.
#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    /// Segment the chunk was written into; -1 before the first rotation.
    pub segment_num: i32,
    /// Index of the chunk within its segment, starting at 0.
    pub segment_id: i32,
    /// The encoded chunk, for the optional bitstream publisher.
    pub chunk: Bytes,
}

pub trait FrameCodec: Send {
    /// Move output into `path` for segment `segment`. The per-segment
    /// chunk index restarts at 0.
    fn rotate(&mut self, path: &Path, segment: i32) -> Result<()>;

    /// Encode one frame into the current segment. Before the first
    /// rotation the chunk is produced but not persisted (streaming-only).
    fn encode(&mut self, frame: &YuvFrame, extra: &FrameExtra) -> Result<EncodeOutcome>;

    fn close(&mut self) -> Result<()>;
}

/// Builds the codec once the stream geometry is known (first connect).
pub type CodecFactory = Box<dyn Fn(&StreamInfo) -> Result<Box<dyn FrameCodec>> + Send>;

/// Bundled [`FrameCodec`]: a length-delimited chunk container.
///
/// Stands where the hardware encoder integration goes; it preserves every
/// property the workers rely on (per-segment files, restarting chunk
/// index, chunk bytes for streaming) without binding to a codec library.
pub struct ChunkWriter {
    file_name: String,
    file: Option<BufWriter<File>>,
    segment_num: i32,
    segment_id: i32,
}

impl ChunkWriter {
    pub fn new(stream_name: &str, info: &StreamInfo, bitrate: u32) -> Self {
        debug!(
            "chunk writer init {}: {}x{} @{}fps, {} bps",
            stream_name, info.width, info.height, info.fps, bitrate
        );
        Self {
            file_name: format!("{stream_name}.vid"),
            file: None,
            segment_num: -1,
            segment_id: 0,
        }
    }
}

impl FrameCodec for ChunkWriter {
    fn rotate(&mut self, path: &Path, segment: i32) -> Result<()> {
        if let Some(mut old) = self.file.take() {
            old.flush().context("video chunk flush failed")?;
        }
        let file_path = path.join(&self.file_name);
        self.file = Some(BufWriter::new(File::create(&file_path).with_context(
            || format!("failed to create {}", file_path.display()),
        )?));
        self.segment_num = segment;
        self.segment_id = 0;
        Ok(())
    }

    fn encode(&mut self, frame: &YuvFrame, _extra: &FrameExtra) -> Result<EncodeOutcome> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(&(frame.data.len() as u32).to_le_bytes())?;
            file.write_all(&frame.data)?;
        }
        let outcome = EncodeOutcome {
            segment_num: self.segment_num,
            segment_id: self.segment_id,
            chunk: frame.data.clone(),
        };
        self.segment_id += 1;
        Ok(outcome)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().context("video chunk flush failed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info() -> StreamInfo {
        StreamInfo {
            width: 4,
            height: 4,
            fps: 20,
        }
    }

    fn frame(byte: u8) -> (YuvFrame, FrameExtra) {
        (
            YuvFrame {
                data: Bytes::from(vec![byte; 24]),
            },
            FrameExtra {
                frame_id: byte as u32,
                timestamp_eof: 0,
            },
        )
    }

    #[test]
    fn test_segment_id_restarts_on_rotate() {
        let dir = TempDir::new().unwrap();
        let seg0 = dir.path().join("0");
        let seg1 = dir.path().join("1");
        std::fs::create_dir_all(&seg0).unwrap();
        std::fs::create_dir_all(&seg1).unwrap();

        let mut codec = ChunkWriter::new("rear", &info(), 5_000_000);
        codec.rotate(&seg0, 0).unwrap();
        let (f, e) = frame(1);
        assert_eq!(codec.encode(&f, &e).unwrap().segment_id, 0);
        assert_eq!(codec.encode(&f, &e).unwrap().segment_id, 1);

        codec.rotate(&seg1, 1).unwrap();
        let out = codec.encode(&f, &e).unwrap();
        assert_eq!((out.segment_num, out.segment_id), (1, 0));
        codec.close().unwrap();

        assert!(seg0.join("rear.vid").exists());
        assert!(seg1.join("rear.vid").exists());
    }

    #[test]
    fn test_encode_before_rotate_streams_only() {
        let mut codec = ChunkWriter::new("rear", &info(), 5_000_000);
        let (f, e) = frame(7);
        let out = codec.encode(&f, &e).unwrap();
        assert_eq!(out.segment_num, -1);
        assert_eq!(out.chunk, f.data);
        codec.close().unwrap();
    }
}
