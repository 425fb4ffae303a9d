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

//! Init-data and boot records.
//!
//! The init record is the first record of every segment: device identity,
//! software and kernel state, and a dump of the persisted params store.
//! Every field is best effort: a missing source is omitted, never fatal.
//! The boot record (one-shot `--bootlog` mode) additionally captures the
//! pstore remains of the previous boot.

use crate::clock::{mono_time_ns, wall_time_ns};
use crate::events::{build_event, EventKind};
use crate::logger::Logger;
use crate::params::Params;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub const DEVICE_TYPE: &str = "neo";

const CMDLINE_PATH: &str = "/proc/cmdline";
const KERNEL_VERSION_PATH: &str = "/proc/version";
const BUILD_PROPS_PATH: &str = "/system/build.prop";
const CONSOLE_RAMOOPS_PATH: &str = "/sys/fs/pstore/console-ramoops";
const PMSG_RAMOOPS_PATH: &str = "/sys/fs/pstore/pmsg-ramoops-0";

#[derive(Debug, Serialize)]
struct InitData {
    device_type: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kernel_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kernel_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dongle_id: Option<String>,
    dirty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    git_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    git_remote: Option<String>,
    passive: bool,
    params: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct BootData {
    wall_time_nanos: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_kmsg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pmsg: Option<String>,
}

fn read_file(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// `key=value` lines; comments and blanks skipped.
fn read_properties(path: &str) -> Option<BTreeMap<String, String>> {
    let content = read_file(path)?;
    let mut props = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Some(props)
}

/// Build the init-data event. Called once per logger lifetime; the logger
/// replays the bytes at the start of each segment.
pub fn build_init_event(params: &Params) -> Result<Vec<u8>> {
    let init = InitData {
        device_type: DEVICE_TYPE,
        version: env!("CARGO_PKG_VERSION"),
        kernel_args: read_file(CMDLINE_PATH)
            .map(|s| s.split_whitespace().map(str::to_string).collect()),
        kernel_version: read_file(KERNEL_VERSION_PATH),
        properties: read_properties(BUILD_PROPS_PATH),
        dongle_id: std::env::var("DONGLE_ID").ok(),
        dirty: std::env::var_os("CLEAN").is_none(),
        git_commit: params.read("GitCommit"),
        git_branch: params.read("GitBranch"),
        git_remote: params.read("GitRemote"),
        passive: params.read_bool("Passive"),
        params: params.read_all(),
    };

    let payload = serde_json::to_vec(&init).context("failed to serialize init data")?;
    Ok(build_event(EventKind::InitData, mono_time_ns(), &payload))
}

/// Build the boot event: wall clock plus whatever the kernel preserved in
/// pstore from the previous boot.
pub fn build_boot_event() -> Result<Vec<u8>> {
    let boot = BootData {
        wall_time_nanos: wall_time_ns(),
        last_kmsg: read_file(CONSOLE_RAMOOPS_PATH),
        last_pmsg: read_file(PMSG_RAMOOPS_PATH),
    };
    let payload = serde_json::to_vec(&boot).context("failed to serialize boot data")?;
    Ok(build_event(EventKind::Boot, mono_time_ns(), &payload))
}

/// One-shot `--bootlog` mode: open a single segment holding exactly the
/// init record and the boot record, then exit. No subscriptions, no
/// encoders.
pub fn run_bootlog<P: AsRef<Path>>(log_root: P, params: &Params) -> Result<()> {
    let init = build_init_event(params)?;
    let logger = Logger::new(log_root, "bootlog", init, false)?;
    let (seg, path) = logger.next_segment()?;
    info!("bootlog to {} (segment {})", path.display(), seg);

    let boot = build_boot_event()?;
    logger.log(&boot, false)?;
    logger.close();
    Ok(())
}
