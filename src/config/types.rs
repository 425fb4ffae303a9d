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

// Configuration types for route-recorder

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The topic whose events carry the rear-camera frame ids that anchor
/// segment rotation.
pub const FRAME_SERVICE: &str = "frame";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub recorder: RecorderSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Topic subscriptions, filled from the service list file.
    #[serde(default, skip)]
    pub services: Vec<ServiceConfig>,
}

/// Recorder-specific settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderSettings {
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,

    #[serde(default = "default_params_root")]
    pub params_root: PathBuf,

    #[serde(default = "default_segment_length")]
    pub segment_length_seconds: f64,

    #[serde(default = "default_camera_fps")]
    pub camera_fps: u32,

    #[serde(default = "default_rear_bitrate")]
    pub rear_bitrate: u32,

    #[serde(default = "default_front_bitrate")]
    pub front_bitrate: u32,

    #[serde(default = "default_rear_index_port")]
    pub rear_index_port: u16,

    #[serde(default = "default_front_index_port")]
    pub front_index_port: u16,

    #[serde(default = "default_stream_port")]
    pub stream_port: u16,

    #[serde(default = "default_rear_frame_socket")]
    pub rear_frame_socket: PathBuf,

    #[serde(default = "default_front_frame_socket")]
    pub front_frame_socket: PathBuf,

    /// Record lossless raw clips of the rear camera at random intervals.
    #[serde(default)]
    pub raw_clips: bool,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            log_root: default_log_root(),
            params_root: default_params_root(),
            segment_length_seconds: default_segment_length(),
            camera_fps: default_camera_fps(),
            rear_bitrate: default_rear_bitrate(),
            front_bitrate: default_front_bitrate(),
            rear_index_port: default_rear_index_port(),
            front_index_port: default_front_index_port(),
            stream_port: default_stream_port(),
            rear_frame_socket: default_rear_frame_socket(),
            front_frame_socket: default_front_frame_socket(),
            raw_clips: false,
        }
    }
}

/// One service list entry: a topic the recorder subscribes to.
///
/// Service list format (YAML):
/// ```yaml
/// frame:   [8002, true, 50., 1]
/// can:     [8006, true, 100., 100]
/// gps_ext: [8032, true, 10., 1, "192.168.5.10"]
/// ```
/// Tuple elements: port, should_log, decimation (not the recorder's
/// concern), quicklog frequency, optional remote host. Entries carrying a
/// remote host are timestamp-patchable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub port: u16,
    pub should_log: bool,
    /// Mark every k-th message for the quicklog; 0 = never.
    pub qlog_freq: i32,
    pub remote_host: Option<String>,
}

impl ServiceConfig {
    /// Subscriber endpoint for this topic.
    pub fn endpoint(&self) -> String {
        let host = self.remote_host.as_deref().unwrap_or("127.0.0.1");
        format!("{}:{}", host, self.port)
    }

    pub fn patch_timestamp(&self) -> bool {
        self.remote_host.is_some()
    }

    pub fn is_frame(&self) -> bool {
        self.name == FRAME_SERVICE
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_log_root() -> PathBuf {
    PathBuf::from("/data/media/0/realdata")
}
fn default_params_root() -> PathBuf {
    PathBuf::from("/data/params/d")
}
fn default_segment_length() -> f64 {
    60.0
}
fn default_camera_fps() -> u32 {
    20
}
fn default_rear_bitrate() -> u32 {
    5_000_000
}
fn default_front_bitrate() -> u32 {
    1_000_000
}
fn default_rear_index_port() -> u16 {
    8015
}
fn default_front_index_port() -> u16 {
    8061
}
fn default_stream_port() -> u16 {
    9002
}
fn default_rear_frame_socket() -> PathBuf {
    PathBuf::from("/tmp/camera_rear.sock")
}
fn default_front_frame_socket() -> PathBuf {
    PathBuf::from("/tmp/camera_front.sock")
}
fn default_log_level() -> String {
    "info".to_string()
}
