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

// Encoder-side of the recorder
//
// One worker per camera pulls frames from the camera stream, compresses
// them through the codec seam, and emits per-frame index events aligned to
// the segmented log. The rear camera additionally records short lossless
// raw clips at random intervals.

pub mod codec;
pub mod raw_clip;
pub mod worker;

pub use codec::{ChunkWriter, CodecFactory, EncodeOutcome, FrameCodec};
pub use raw_clip::RawClipLogger;
pub use worker::{run_encoder, EncoderConfig};
