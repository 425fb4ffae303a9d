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

// Segmented multi-stream recorder for a vehicle driving stack
//
// This crate:
// - Subscribes to every configured bus topic and persists each inbound
//   event to a segmented on-disk log
// - Mirrors a per-topic subsample into a compressed quicklog
// - Drives one encoder worker per camera, emitting per-frame index
//   records aligned to the log
// - Rotates every output synchronously to a new segment on a fixed
//   wall-clock cadence

pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod encoder;
pub mod events;
pub mod ingest;
pub mod init_data;
pub mod logger;
pub mod params;
pub mod vision;

// Re-export main types
pub use bus::{BusSocket, IndexPublisher, TcpSubscriber};
pub use clock::SegmentClock;
pub use config::{load_config, RecorderConfig, ServiceConfig};
pub use coordinator::{Coordinator, FRAME_GAP};
pub use encoder::{run_encoder, ChunkWriter, EncoderConfig, FrameCodec, RawClipLogger};
pub use events::{EncodeIndex, EventKind, StreamKind};
pub use ingest::{IngestLoop, Subscription};
pub use init_data::{build_boot_event, build_init_event, run_bootlog};
pub use logger::{clear_locks, read_log, read_qlog, LogHandle, Logger};
pub use params::Params;
pub use vision::{ChannelFrameSource, FrameExtra, FrameFeeder, FrameSource, StreamInfo, YuvFrame};
