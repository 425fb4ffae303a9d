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

//! Encoder worker: one long-lived thread per camera.
//!
//! The worker pulls frames from the camera stream, synchronises with the
//! rotation coordinator before each encode (the rear camera is the timing
//! anchor and may wait for ingest to catch up), and emits one encode-index
//! event per frame, published on the camera's index port and appended
//! through a writer handle so it lands in the same segment as the frame's
//! ingest-side metadata.

use crate::bus::IndexPublisher;
use crate::clock::{mono_time_ns, mono_time_s};
use crate::coordinator::Coordinator;
use crate::encoder::codec::CodecFactory;
use crate::encoder::raw_clip::RawClipLogger;
use crate::events::{EncodeIndex, StreamKind};
use crate::logger::{LogHandle, Logger};
use crate::params::Params;
use crate::vision::FrameSource;
use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const CONNECT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Stream name used for output files and log lines ("rear", "front").
    pub stream_name: String,
    pub is_front: bool,
    pub bitrate: u32,
    /// Record lossless raw clips alongside the main stream (rear only).
    pub raw_clips: bool,
}

/// Run one encoder worker to completion (shutdown or unrecoverable setup
/// failure). Frame-level errors never leave this function: the worker logs
/// them and re-enters its reconnect loop.
#[allow(clippy::too_many_arguments)]
pub fn run_encoder(
    cfg: EncoderConfig,
    coordinator: Arc<Coordinator>,
    logger: Arc<Logger>,
    params: Params,
    mut source: Box<dyn FrameSource>,
    codec_factory: CodecFactory,
    mut index_pub: Option<IndexPublisher>,
    mut stream_pub: Option<IndexPublisher>,
) -> Result<()> {
    if cfg.is_front {
        if !params.read_bool("RecordFront") {
            info!("front camera recording disabled, encoder exiting");
            return Ok(());
        }
        info!("recording front camera");
    }

    let main_stream = if cfg.is_front {
        StreamKind::Front
    } else {
        StreamKind::Rear
    };

    let mut codec = None;
    let mut encoder_segment: i32 = -1;
    let mut handle: Option<LogHandle> = None;
    let mut cnt: u32 = 0;

    while !coordinator.is_shutdown() {
        let stream_info = match source.connect() {
            Ok(info) => info,
            Err(e) => {
                debug!("{}: frame stream connect failed: {}", cfg.stream_name, e);
                std::thread::sleep(CONNECT_RETRY);
                continue;
            }
        };

        if codec.is_none() {
            info!(
                "{}: encoder init {}x{}",
                cfg.stream_name, stream_info.width, stream_info.height
            );
            codec = Some(codec_factory(&stream_info)?);
        }
        let Some(enc) = codec.as_mut() else { break };

        // a fresh clip schedule per connect: no clip in the first interval
        let mut raw_clip = cfg.raw_clips.then(|| RawClipLogger::new(mono_time_s()));

        while !coordinator.is_shutdown() {
            let Some((frame, extra)) = source.recv_frame() else {
                debug!("{}: frame stream ended", cfg.stream_name);
                break;
            };

            trace!(
                "{}: frame {} latency {:.2} ms",
                cfg.stream_name,
                extra.frame_id,
                mono_time_ns().saturating_sub(extra.timestamp_eof) as f64 / 1e6
            );

            let synced = coordinator.encoder_sync(
                cfg.is_front,
                encoder_segment,
                extra.frame_id,
                |target| {
                    info!(
                        "{}: rotate encoder to {}",
                        cfg.stream_name,
                        target.path.display()
                    );
                    enc.rotate(&target.path, target.segment)?;
                    if let Some(clips) = raw_clip.as_mut() {
                        clips.rotate(&target.path, target.segment)?;
                    }
                    // release the old segment before binding to the new one
                    handle = logger.get_handle();
                    Ok(())
                },
            );
            encoder_segment = match synced {
                Ok(seg) => seg,
                Err(e) => {
                    warn!("{}: rotation failed: {}", cfg.stream_name, e);
                    break;
                }
            };
            if coordinator.is_shutdown() {
                break;
            }

            let outcome = match enc.encode(&frame, &extra) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("{}: encode failed: {}", cfg.stream_name, e);
                    break;
                }
            };

            let event = Bytes::from(
                EncodeIndex {
                    frame_id: extra.frame_id,
                    stream: main_stream,
                    encode_id: cnt,
                    segment_num: outcome.segment_num,
                    segment_id: outcome.segment_id,
                }
                .to_event(mono_time_ns()),
            );
            if let Some(publisher) = index_pub.as_mut() {
                publisher.publish(&event);
            }
            if let Some(h) = handle.as_ref() {
                if let Err(e) = h.log(&event, false) {
                    warn!("{}: index log failed: {}", cfg.stream_name, e);
                }
            }
            if let Some(publisher) = stream_pub.as_mut() {
                publisher.publish(&outcome.chunk);
            }

            if let Some(clips) = raw_clip.as_mut() {
                let now_s = mono_time_s();
                if clips.due(now_s) {
                    match clips.log_frame(&frame, now_s) {
                        Ok(Some((segment_num, segment_id))) => {
                            let clip_event = EncodeIndex {
                                frame_id: extra.frame_id,
                                stream: StreamKind::LosslessClip,
                                encode_id: cnt,
                                segment_num,
                                segment_id,
                            }
                            .to_event(mono_time_ns());
                            if let Some(h) = handle.as_ref() {
                                if let Err(e) = h.log(&clip_event, false) {
                                    warn!("{}: clip index log failed: {}", cfg.stream_name, e);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("{}: raw clip write failed: {}", cfg.stream_name, e),
                    }
                }
            }

            cnt += 1;
        }

        handle = None;
        if let Some(clips) = raw_clip.as_mut() {
            if let Err(e) = clips.close() {
                warn!("{}: clip close failed: {}", cfg.stream_name, e);
            }
        }
    }

    if let Some(mut enc) = codec {
        info!("{}: encoder close", cfg.stream_name);
        enc.close()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::codec::{ChunkWriter, FrameCodec};
    use crate::vision::{ChannelFrameSource, StreamInfo};
    use tempfile::TempDir;

    #[test]
    fn test_front_worker_exits_without_record_flag() {
        let dir = TempDir::new().unwrap();
        let logger = Arc::new(Logger::new(dir.path(), "rlog", Vec::new(), false).unwrap());
        let coordinator = Arc::new(Coordinator::new());
        let params = Params::new(dir.path().join("params"));
        let info = StreamInfo {
            width: 4,
            height: 4,
            fps: 20,
        };
        let (_feeder, source) = ChannelFrameSource::pair(info);

        let cfg = EncoderConfig {
            stream_name: "front".to_string(),
            is_front: true,
            bitrate: 1_000_000,
            raw_clips: false,
        };
        let result = run_encoder(
            cfg,
            coordinator,
            logger,
            params,
            Box::new(source),
            Box::new(|info| {
                Ok(Box::new(ChunkWriter::new("front", info, 1_000_000)) as Box<dyn FrameCodec>)
            }),
            None,
            None,
        );
        assert!(result.is_ok());
    }
}
