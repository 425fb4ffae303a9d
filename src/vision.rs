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

//! Camera frame stream seam.
//!
//! The upstream camera process owns the actual frame transport; the
//! recorder consumes it through [`FrameSource`]: connect (yielding the
//! stream geometry), then pull planar YUV frames tagged with a
//! monotonically increasing `frame_id` and a capture timestamp.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc;

/// Geometry of a connected frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Capture metadata attached to each frame by the camera process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameExtra {
    pub frame_id: u32,
    /// Monotonic capture timestamp (end of frame), nanoseconds.
    pub timestamp_eof: u64,
}

/// One planar YUV 4:2:0 frame. `Bytes` so the main codec, the raw-clip
/// logger, and the bitstream publisher can share it without copying.
#[derive(Debug, Clone)]
pub struct YuvFrame {
    pub data: Bytes,
}

pub trait FrameSource: Send {
    /// (Re)connect to the stream. Errors are transient: the worker sleeps
    /// and retries.
    fn connect(&mut self) -> Result<StreamInfo>;

    /// Next frame, blocking. `None` means the stream ended and the worker
    /// should reconnect.
    fn recv_frame(&mut self) -> Option<(YuvFrame, FrameExtra)>;
}

/// Frame stream client over a Unix socket published by the camera process.
///
/// Wire format: one header frame `[u32 width][u32 height][u32 fps]`, then
/// per frame `[u32 len][u32 frame_id][u64 timestamp_eof][len-12 bytes yuv]`.
pub struct SocketFrameSource {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl SocketFrameSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            stream: None,
        }
    }

    fn read_exact(stream: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
        stream.read_exact(buf).context("frame stream read failed")
    }
}

impl FrameSource for SocketFrameSource {
    fn connect(&mut self) -> Result<StreamInfo> {
        let mut stream = UnixStream::connect(&self.path)
            .with_context(|| format!("cannot connect to {}", self.path.display()))?;
        let mut header = [0u8; 12];
        Self::read_exact(&mut stream, &mut header)?;
        let word = |i: usize| u32::from_le_bytes(header[i * 4..i * 4 + 4].try_into().unwrap());
        let info = StreamInfo {
            width: word(0),
            height: word(1),
            fps: word(2),
        };
        if info.width == 0 || info.height == 0 {
            bail!("bogus stream geometry {}x{}", info.width, info.height);
        }
        self.stream = Some(stream);
        Ok(info)
    }

    fn recv_frame(&mut self) -> Option<(YuvFrame, FrameExtra)> {
        let stream = self.stream.as_mut()?;

        let mut len = [0u8; 4];
        if Self::read_exact(stream, &mut len).is_err() {
            self.stream = None;
            return None;
        }
        let len = u32::from_le_bytes(len) as usize;
        if len < 12 {
            self.stream = None;
            return None;
        }

        let mut body = vec![0u8; len];
        if Self::read_exact(stream, &mut body).is_err() {
            self.stream = None;
            return None;
        }

        let frame_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let timestamp_eof = u64::from_le_bytes(body[4..12].try_into().unwrap());
        body.drain(..12);
        Some((
            YuvFrame {
                data: Bytes::from(body),
            },
            FrameExtra {
                frame_id,
                timestamp_eof,
            },
        ))
    }
}

/// In-process frame source fed through a channel. Stands in for the camera
/// stream in tests and local tooling.
pub struct ChannelFrameSource {
    info: StreamInfo,
    rx: mpsc::Receiver<(YuvFrame, FrameExtra)>,
    ended: bool,
}

/// Sending side of a [`ChannelFrameSource`].
pub struct FrameFeeder {
    tx: mpsc::SyncSender<(YuvFrame, FrameExtra)>,
}

impl ChannelFrameSource {
    pub fn pair(info: StreamInfo) -> (FrameFeeder, Self) {
        let (tx, rx) = mpsc::sync_channel(64);
        (
            FrameFeeder { tx },
            Self {
                info,
                rx,
                ended: false,
            },
        )
    }
}

impl FrameFeeder {
    /// Feed one frame, blocking while the worker is behind. Fails once the
    /// source side is gone.
    pub fn feed(&self, frame_id: u32, timestamp_eof: u64, data: &[u8]) -> Result<()> {
        self.tx
            .send((
                YuvFrame {
                    data: Bytes::copy_from_slice(data),
                },
                FrameExtra {
                    frame_id,
                    timestamp_eof,
                },
            ))
            .map_err(|_| anyhow::anyhow!("frame source dropped"))
    }
}

impl FrameSource for ChannelFrameSource {
    fn connect(&mut self) -> Result<StreamInfo> {
        if self.ended {
            bail!("frame channel closed");
        }
        Ok(self.info)
    }

    fn recv_frame(&mut self) -> Option<(YuvFrame, FrameExtra)> {
        match self.rx.recv() {
            Ok(frame) => Some(frame),
            Err(_) => {
                self.ended = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_source_delivers_in_order() {
        let info = StreamInfo {
            width: 4,
            height: 4,
            fps: 20,
        };
        let (feeder, mut source) = ChannelFrameSource::pair(info);
        assert_eq!(source.connect().unwrap(), info);

        feeder.feed(0, 100, &[1u8; 24]).unwrap();
        feeder.feed(1, 200, &[2u8; 24]).unwrap();
        let (f0, e0) = source.recv_frame().unwrap();
        assert_eq!((e0.frame_id, e0.timestamp_eof), (0, 100));
        assert_eq!(f0.data.as_ref(), &[1u8; 24]);
        let (_, e1) = source.recv_frame().unwrap();
        assert_eq!(e1.frame_id, 1);
    }

    #[test]
    fn test_channel_source_ends_when_feeder_drops() {
        let info = StreamInfo {
            width: 4,
            height: 4,
            fps: 20,
        };
        let (feeder, mut source) = ChannelFrameSource::pair(info);
        drop(feeder);
        assert!(source.recv_frame().is_none());
        assert!(source.connect().is_err());
    }
}
