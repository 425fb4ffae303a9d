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

// Read-only view of the persisted params store (one file per key)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_PARAMS_ROOT: &str = "/data/params/d";

/// File-per-key parameter directory written by the rest of the stack.
/// The recorder only reads it; a missing key is never an error.
#[derive(Debug, Clone)]
pub struct Params {
    root: PathBuf,
}

impl Params {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Read one key. `None` when absent or unreadable.
    pub fn read(&self, key: &str) -> Option<String> {
        let raw = std::fs::read_to_string(self.root.join(key)).ok()?;
        Some(raw.trim_end_matches('\n').to_string())
    }

    /// True iff the key exists and its value starts with `'1'`.
    pub fn read_bool(&self, key: &str) -> bool {
        self.read(key).map(|v| v.starts_with('1')).unwrap_or(false)
    }

    /// Full dump, sorted by key. Subdirectories and unreadable entries are
    /// skipped.
    pub fn read_all(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some(value) = self.read(&name) {
                out.insert(name, value);
            }
        }
        out
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMS_ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(pairs: &[(&str, &str)]) -> (Params, TempDir) {
        let dir = TempDir::new().unwrap();
        for (k, v) in pairs {
            std::fs::write(dir.path().join(k), v).unwrap();
        }
        (Params::new(dir.path()), dir)
    }

    #[test]
    fn test_read_trims_trailing_newline() {
        let (params, _dir) = store(&[("GitBranch", "release\n")]);
        assert_eq!(params.read("GitBranch").as_deref(), Some("release"));
    }

    #[test]
    fn test_missing_key_is_none() {
        let (params, _dir) = store(&[]);
        assert_eq!(params.read("GitCommit"), None);
        assert!(!params.read_bool("RecordFront"));
    }

    #[test]
    fn test_read_bool() {
        let (params, _dir) = store(&[("RecordFront", "1"), ("Passive", "0")]);
        assert!(params.read_bool("RecordFront"));
        assert!(!params.read_bool("Passive"));
    }

    #[test]
    fn test_read_all_sorted() {
        let (params, _dir) = store(&[("b", "2"), ("a", "1"), ("c", "3")]);
        let all = params.read_all();
        let keys: Vec<_> = all.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(all["b"], "2");
    }
}
