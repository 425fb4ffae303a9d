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

// Configuration module for route-recorder
//
// Provides:
// - Service list loading (topic subscriptions)
// - Optional recorder settings file
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use loader::{default_service_list_path, ConfigLoader};
pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration: recorder settings (optional file) plus the service
/// list.
pub fn load_config(
    config_path: Option<&Path>,
    service_list_path: &Path,
) -> Result<RecorderConfig> {
    ConfigLoader::load(config_path, service_list_path).context("Failed to load configuration")
}
