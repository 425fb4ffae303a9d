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

//! Segmented on-disk log adapter.
//!
//! Each segment is a directory under the log root named by a monotonically
//! increasing integer, holding the main log (`u32` LE length-delimited
//! records, uncompressed) and, when enabled, a zstd-compressed quicklog
//! mirror. A `.lock` marker exists while the segment is open; leftover
//! markers from a crashed run are swept at the next startup.
//!
//! Writer handles are reference counted: the ingest loop writes through the
//! logger directly, encoder workers hold one handle each, bound to the
//! segment they are encoding into. A segment finalises (flush, lock-file
//! unlink) when its last handle drops.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const QLOG_NAME: &str = "qlog.zst";
const LOCK_SUFFIX: &str = ".lock";

struct SegmentFiles {
    log: BufWriter<File>,
    qlog: Option<zstd::stream::write::AutoFinishEncoder<'static, BufWriter<File>>>,
}

struct Segment {
    seg_num: i32,
    lock_path: PathBuf,
    files: Mutex<SegmentFiles>,
}

impl Segment {
    fn write(&self, data: &[u8], qlog: bool) -> Result<()> {
        let mut files = self.files.lock();
        let len = (data.len() as u32).to_le_bytes();
        files.log.write_all(&len)?;
        files.log.write_all(data)?;
        if qlog {
            if let Some(encoder) = files.qlog.as_mut() {
                encoder.write_all(&len)?;
                encoder.write_all(data)?;
            }
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let mut files = self.files.lock();
        if let Err(e) = files.log.flush() {
            warn!("segment {} flush failed: {}", self.seg_num, e);
        }
        // dropping the encoder finishes the zstd stream
        files.qlog = None;
        if let Err(e) = fs::remove_file(&self.lock_path) {
            warn!("could not unlink {}: {}", self.lock_path.display(), e);
        }
    }
}

/// Reference-counted append cursor into one segment's log files.
pub struct LogHandle(Arc<Segment>);

impl LogHandle {
    pub fn log(&self, data: &[u8], qlog: bool) -> Result<()> {
        self.0.write(data, qlog)
    }

    pub fn segment_num(&self) -> i32 {
        self.0.seg_num
    }
}

struct LoggerInner {
    next_seg: i32,
    current: Option<Arc<Segment>>,
}

pub struct Logger {
    root: PathBuf,
    log_name: String,
    init_data: Vec<u8>,
    has_qlog: bool,
    inner: Mutex<LoggerInner>,
}

impl Logger {
    /// Open a logger over `root`. Segment numbering continues after the
    /// highest integer directory already present so restarts never reuse a
    /// segment name. No segment is opened until [`Logger::next_segment`].
    pub fn new<P: AsRef<Path>>(
        root: P,
        log_name: &str,
        init_data: Vec<u8>,
        has_qlog: bool,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create log root {}", root.display()))?;

        let next_seg = fs::read_dir(&root)
            .with_context(|| format!("failed to scan log root {}", root.display()))?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.parse::<i32>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);

        Ok(Self {
            root,
            log_name: log_name.to_string(),
            init_data,
            has_qlog,
            inner: Mutex::new(LoggerInner {
                next_seg,
                current: None,
            }),
        })
    }

    /// Open the next segment and make it current. The previous segment
    /// finalises once every outstanding handle is dropped. The init-data
    /// record is written first, to the main log and the quicklog alike.
    pub fn next_segment(&self) -> Result<(i32, PathBuf)> {
        let mut inner = self.inner.lock();
        let seg_num = inner.next_seg;
        let path = self.root.join(seg_num.to_string());
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create segment {}", path.display()))?;

        let log_path = path.join(&self.log_name);
        let log = BufWriter::new(
            File::create(&log_path)
                .with_context(|| format!("failed to create {}", log_path.display()))?,
        );
        let qlog = if self.has_qlog {
            let qlog_path = path.join(QLOG_NAME);
            let file = BufWriter::new(
                File::create(&qlog_path)
                    .with_context(|| format!("failed to create {}", qlog_path.display()))?,
            );
            let encoder = zstd::stream::write::Encoder::new(file, zstd::DEFAULT_COMPRESSION_LEVEL)
                .context("failed to start quicklog compressor")?;
            Some(encoder.auto_finish())
        } else {
            None
        };

        let lock_path = path.join(format!("{}{}", self.log_name, LOCK_SUFFIX));
        File::create(&lock_path)
            .with_context(|| format!("failed to create {}", lock_path.display()))?;

        let segment = Arc::new(Segment {
            seg_num,
            lock_path,
            files: Mutex::new(SegmentFiles { log, qlog }),
        });

        if !self.init_data.is_empty() {
            segment.write(&self.init_data, self.has_qlog)?;
        }

        inner.next_seg += 1;
        inner.current = Some(segment);
        debug!("opened segment {} at {}", seg_num, path.display());
        Ok((seg_num, path))
    }

    /// Append one record to the current segment (and mark it for the
    /// quicklog). A no-op while no segment is open (only-stream mode).
    pub fn log(&self, data: &[u8], qlog: bool) -> Result<()> {
        let current = self.inner.lock().current.clone();
        match current {
            Some(segment) => segment.write(data, qlog && self.has_qlog),
            None => Ok(()),
        }
    }

    /// A refcounted handle bound to the current segment, or `None` before
    /// the first rotation.
    pub fn get_handle(&self) -> Option<LogHandle> {
        self.inner.lock().current.clone().map(LogHandle)
    }

    /// Drop the logger's own reference to the current segment. Outstanding
    /// encoder handles keep their segment alive until they drop too.
    pub fn close(&self) {
        self.inner.lock().current = None;
    }
}

/// Unlink every `*.lock` file under `root`, depth-first, bounded by
/// `max_depth`. Run at startup so segments from a crashed run do not look
/// in-flight forever.
pub fn clear_locks<P: AsRef<Path>>(root: P, max_depth: usize) {
    fn walk(dir: &Path, depth: usize) {
        if depth == 0 {
            return;
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, depth - 1);
            } else if path.extension().map(|e| e == "lock").unwrap_or(false) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("could not unlink {}: {}", path.display(), e);
                }
            }
        }
    }
    walk(root.as_ref(), max_depth);
}

/// Read every record of an uncompressed segment log, in order.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<u8>>> {
    let mut raw = Vec::new();
    File::open(path.as_ref())
        .with_context(|| format!("failed to open {}", path.as_ref().display()))?
        .read_to_end(&mut raw)?;
    parse_records(&raw)
}

/// Read every record of a zstd-compressed quicklog, in order.
pub fn read_qlog<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<u8>>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("failed to open {}", path.as_ref().display()))?;
    let raw = zstd::decode_all(file).context("quicklog decompression failed")?;
    parse_records(&raw)
}

fn parse_records(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < raw.len() {
        anyhow::ensure!(offset + 4 <= raw.len(), "truncated record length at {}", offset);
        let len = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        anyhow::ensure!(offset + len <= raw.len(), "truncated record body at {}", offset);
        records.push(raw[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, init: &[u8], qlog: bool) -> Logger {
        Logger::new(dir.path(), "rlog", init.to_vec(), qlog).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_order() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"", false);
        let (_, path) = logger.next_segment().unwrap();

        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; i as usize + 1]).collect();
        for p in &payloads {
            logger.log(p, false).unwrap();
        }
        logger.close();

        assert_eq!(read_log(path.join("rlog")).unwrap(), payloads);
    }

    #[test]
    fn test_init_record_first_in_log_and_qlog() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"init-record", true);
        let (_, path) = logger.next_segment().unwrap();
        logger.log(b"payload", true).unwrap();
        logger.close();

        let log = read_log(path.join("rlog")).unwrap();
        assert_eq!(log[0], b"init-record");
        assert_eq!(log[1], b"payload");
        let qlog = read_qlog(path.join(QLOG_NAME)).unwrap();
        assert_eq!(qlog[0], b"init-record");
        assert_eq!(qlog[1], b"payload");
    }

    #[test]
    fn test_qlog_mark_filters_records() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"", true);
        let (_, path) = logger.next_segment().unwrap();
        logger.log(b"a", true).unwrap();
        logger.log(b"b", false).unwrap();
        logger.log(b"c", true).unwrap();
        logger.close();

        assert_eq!(read_log(path.join("rlog")).unwrap().len(), 3);
        let qlog = read_qlog(path.join(QLOG_NAME)).unwrap();
        assert_eq!(qlog, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_segment_numbering_continues_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let logger = open(&dir, b"", false);
            assert_eq!(logger.next_segment().unwrap().0, 0);
            assert_eq!(logger.next_segment().unwrap().0, 1);
            logger.close();
        }
        let logger = open(&dir, b"", false);
        assert_eq!(logger.next_segment().unwrap().0, 2);
    }

    #[test]
    fn test_lock_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"", false);
        let (_, path) = logger.next_segment().unwrap();
        let lock = path.join("rlog.lock");
        assert!(lock.exists());

        let handle = logger.get_handle().unwrap();
        logger.next_segment().unwrap();
        // encoder handle still holds segment 0 open
        assert!(lock.exists());
        drop(handle);
        assert!(!lock.exists());
        logger.close();
    }

    #[test]
    fn test_handle_writes_into_its_own_segment() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"", false);
        let (_, path0) = logger.next_segment().unwrap();
        let handle = logger.get_handle().unwrap();
        assert_eq!(handle.segment_num(), 0);

        let (_, path1) = logger.next_segment().unwrap();
        handle.log(b"old-segment", false).unwrap();
        logger.log(b"new-segment", false).unwrap();
        drop(handle);
        logger.close();

        assert_eq!(read_log(path0.join("rlog")).unwrap(), vec![b"old-segment".to_vec()]);
        assert_eq!(read_log(path1.join("rlog")).unwrap(), vec![b"new-segment".to_vec()]);
    }

    #[test]
    fn test_log_without_segment_is_noop() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"", false);
        logger.log(b"dropped", false).unwrap();
        assert!(logger.get_handle().is_none());
    }

    #[test]
    fn test_empty_segment_is_well_formed() {
        let dir = TempDir::new().unwrap();
        let logger = open(&dir, b"", false);
        let (_, path) = logger.next_segment().unwrap();
        logger.close();
        assert_eq!(read_log(path.join("rlog")).unwrap(), Vec::<Vec<u8>>::new());
        assert!(!path.join("rlog.lock").exists());
    }

    #[test]
    fn test_clear_locks_sweeps_recursively() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("0").join("deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("0").join("rlog.lock"), b"").unwrap();
        fs::write(nested.join("rlog.lock"), b"").unwrap();
        fs::write(nested.join("rlog"), b"keep").unwrap();

        clear_locks(dir.path(), 16);
        assert!(!dir.path().join("0").join("rlog.lock").exists());
        assert!(!nested.join("rlog.lock").exists());
        assert!(nested.join("rlog").exists());
    }
}
