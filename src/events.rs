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

//! Event wire layout shared by every producer on the bus.
//!
//! Events are opaque to the recorder except for two fixed-offset
//! projections, so the layout below is load-bearing and must not change:
//!
//! ```text
//! 0x00..0x04  magic "EVNT"
//! 0x04..0x08  u32 LE event kind
//! 0x08..0x0C  u32 LE payload length
//! 0x0C..0x10  layout tag, exactly 02 00 01 00
//! 0x10..0x18  u64 LE log monotonic time (ns)
//! 0x18..      payload
//! ```
//!
//! Camera frame events carry their `frame_id` as the first payload word,
//! i.e. at byte offset 0x18.

use anyhow::{bail, Result};

pub const EVENT_MAGIC: [u8; 4] = *b"EVNT";

/// Layout tag at offset 0x0C. Doubles as the precondition for the in-place
/// timestamp patch: a buffer without it is not safe to patch.
pub const LAYOUT_TAG: [u8; 4] = [0x02, 0x00, 0x01, 0x00];
pub const LAYOUT_TAG_OFFSET: usize = 0x0C;

/// Offset of the 8-byte monotonic log time, overwritten in place for
/// timestamp-patchable topics.
pub const MONO_TIME_OFFSET: usize = 0x10;

pub const PAYLOAD_OFFSET: usize = 0x18;

/// Camera frame events: `frame_id` is the first payload word.
pub const FRAME_ID_OFFSET: usize = PAYLOAD_OFFSET;

pub const HEADER_LEN: usize = PAYLOAD_OFFSET;

/// Event kinds the recorder itself builds. Inbound kinds from other
/// producers are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    InitData = 0,
    Boot = 1,
    CameraFrame = 2,
    EncodeIndex = 3,
}

/// Which encoded stream an encode-index record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamKind {
    Rear = 0,
    Front = 1,
    LosslessClip = 2,
}

impl StreamKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(StreamKind::Rear),
            1 => Some(StreamKind::Front),
            2 => Some(StreamKind::LosslessClip),
            _ => None,
        }
    }
}

/// Assemble an event buffer with the fixed header.
pub fn build_event(kind: EventKind, log_mono_time_ns: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&EVENT_MAGIC);
    buf.extend_from_slice(&(kind as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&LAYOUT_TAG);
    buf.extend_from_slice(&log_mono_time_ns.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Read the monotonic log time of an event.
pub fn log_mono_time(buf: &[u8]) -> Option<u64> {
    let bytes = buf.get(MONO_TIME_OFFSET..MONO_TIME_OFFSET + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Fixed-offset projection of a camera frame event's `frame_id`.
///
/// This is the only payload inspection the ingest side performs, and it is
/// keyed by socket identity (the frame topic), not by parsing the buffer.
pub fn frame_id(buf: &[u8]) -> Option<u32> {
    let bytes = buf.get(FRAME_ID_OFFSET..FRAME_ID_OFFSET + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Overwrite the event's log time in place with the local receive time.
///
/// Applied to topics published from clock-skewed remote hosts. The buffer
/// must carry the layout tag `02 00 01 00` at offset 0x0C; if it does not,
/// patching would corrupt unknown bytes, so the patch is refused. Callers
/// log the refusal and record the event unmodified.
pub fn patch_mono_time(buf: &mut [u8], now_ns: u64) -> Result<()> {
    let tag = buf.get(LAYOUT_TAG_OFFSET..LAYOUT_TAG_OFFSET + 4);
    if tag != Some(&LAYOUT_TAG[..]) {
        debug_assert!(false, "timestamp patch on a buffer without the layout tag");
        bail!("layout tag missing at 0x{LAYOUT_TAG_OFFSET:X}, refusing timestamp patch");
    }
    if buf.len() < MONO_TIME_OFFSET + 8 {
        bail!("event too short for timestamp patch ({} bytes)", buf.len());
    }
    buf[MONO_TIME_OFFSET..MONO_TIME_OFFSET + 8].copy_from_slice(&now_ns.to_le_bytes());
    Ok(())
}

/// Build a camera frame event. Producers (and tests standing in for the
/// camera process) use this; the recorder itself never emits frames.
pub fn build_frame_event(frame_id: u32, log_mono_time_ns: u64) -> Vec<u8> {
    build_event(EventKind::CameraFrame, log_mono_time_ns, &frame_id.to_le_bytes())
}

/// Per-frame index record aligned to the main log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeIndex {
    pub frame_id: u32,
    pub stream: StreamKind,
    pub encode_id: u32,
    pub segment_num: i32,
    pub segment_id: i32,
}

impl EncodeIndex {
    pub fn to_event(&self, log_mono_time_ns: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&self.frame_id.to_le_bytes());
        payload.extend_from_slice(&(self.stream as u32).to_le_bytes());
        payload.extend_from_slice(&self.encode_id.to_le_bytes());
        payload.extend_from_slice(&self.segment_num.to_le_bytes());
        payload.extend_from_slice(&self.segment_id.to_le_bytes());
        build_event(EventKind::EncodeIndex, log_mono_time_ns, &payload)
    }

    pub fn from_event(buf: &[u8]) -> Option<Self> {
        if buf.get(4..8) != Some(&(EventKind::EncodeIndex as u32).to_le_bytes()[..]) {
            return None;
        }
        let p = buf.get(PAYLOAD_OFFSET..PAYLOAD_OFFSET + 20)?;
        let word = |i: usize| u32::from_le_bytes(p[i * 4..i * 4 + 4].try_into().unwrap());
        Some(EncodeIndex {
            frame_id: word(0),
            stream: StreamKind::from_u32(word(1))?,
            encode_id: word(2),
            segment_num: word(3) as i32,
            segment_id: word(4) as i32,
        })
    }
}

/// True if the buffer is an event of the given kind.
pub fn is_kind(buf: &[u8], kind: EventKind) -> bool {
    buf.get(4..8) == Some(&(kind as u32).to_le_bytes()[..])
}
