//! Framed append-only log
//!
//! Frame layout: `u32` little-endian body length, then a CBOR body.
//! Appends are written under a mutex and (optionally) followed by `sync_data`,
//! so an entry is either fully on disk or, after a crash mid-write, a torn
//! trailing frame that [`FramedLog::open`] truncates away. A write that fails
//! while the process keeps running is cut back to the last committed frame
//! before the error is returned, so later appends never land behind it.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Result, StoreError};

const LEN_PREFIX: usize = 4;

/// Open file plus the length of its last complete frame.
struct Sink {
    file: File,
    committed: u64,
}

impl Sink {
    /// Cut anything past the last committed frame.
    fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.committed)?;
        self.file.sync_data()
    }

    fn write_frame(&mut self, frame: &[u8], sync: bool) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Append-only log of CBOR frames.
pub struct FramedLog {
    sink: Option<Mutex<Sink>>,
    path: Option<PathBuf>,
    sync_writes: bool,
}

impl FramedLog {
    /// Log that keeps nothing on disk (tests, scratch runs).
    pub fn memory() -> Self {
        Self {
            sink: None,
            path: None,
            sync_writes: false,
        }
    }

    /// Open (or create) the log at `path` and replay its entries.
    pub fn open<T: DeserializeOwned>(path: &Path, sync_writes: bool) -> Result<(Self, Vec<T>)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let (entries, good_len) = decode_frames(&bytes, path)?;
        if good_len < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - good_len,
                "truncating torn trailing frame"
            );
            file.set_len(good_len as u64)?;
            file.sync_data()?;
        }

        Ok((
            Self {
                sink: Some(Mutex::new(Sink {
                    file,
                    committed: good_len as u64,
                })),
                path: Some(path.to_path_buf()),
                sync_writes,
            },
            entries,
        ))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one entry; returns the number of bytes written.
    pub fn append<T: Serialize>(&self, entry: &T) -> Result<u64> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(entry, &mut body)
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        let Some(sink) = &self.sink else {
            return Ok((body.len() + LEN_PREFIX) as u64);
        };

        let len = u32::try_from(body.len())
            .map_err(|_| StoreError::Encode(format!("frame too large: {} bytes", body.len())))?;

        let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);

        let mut sink = sink.lock();
        let on_disk = sink.file.metadata()?.len();
        if on_disk > sink.committed {
            tracing::warn!(
                path = ?self.path,
                committed = sink.committed,
                on_disk,
                "cutting partial frame before append"
            );
            sink.rollback()?;
        }

        if let Err(err) = sink.write_frame(&frame, self.sync_writes) {
            if let Err(rollback) = sink.rollback() {
                tracing::error!(
                    path = ?self.path,
                    committed = sink.committed,
                    error = %rollback,
                    "failed to cut partial frame"
                );
            }
            return Err(err.into());
        }
        sink.committed += frame.len() as u64;
        Ok(frame.len() as u64)
    }
}

/// Decode complete frames; returns the entries and the byte length they span.
fn decode_frames<T: DeserializeOwned>(bytes: &[u8], path: &Path) -> Result<(Vec<T>, usize)> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + LEN_PREFIX <= bytes.len() {
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&bytes[pos..pos + LEN_PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let start = pos + LEN_PREFIX;
        let end = start + len;
        if end > bytes.len() {
            break;
        }

        let entry: T = ciborium::de::from_reader(&bytes[start..end]).map_err(|e| {
            StoreError::Corrupt {
                path: path.display().to_string(),
                offset: pos as u64,
                message: e.to_string(),
            }
        })?;
        entries.push(entry);
        pos = end;
    }

    Ok((entries, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");

        {
            let (log, existing) = FramedLog::open::<BTreeMap<String, u32>>(&path, false).unwrap();
            assert!(existing.is_empty());
            let mut entry = BTreeMap::new();
            entry.insert("a".to_string(), 1u32);
            log.append(&entry).unwrap();
            entry.insert("b".to_string(), 2u32);
            log.append(&entry).unwrap();
        }

        // Simulate a crash halfway through a third frame.
        let full_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&200u32.to_le_bytes()).unwrap();
            file.write_all(&[0xa1, 0x61]).unwrap();
        }

        let (_log, entries) = FramedLog::open::<BTreeMap<String, u32>>(&path, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].get("b"), Some(&2));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full_len);
    }

    #[test]
    fn partial_frame_is_cut_before_the_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");

        let (log, _) = FramedLog::open::<String>(&path, true).unwrap();
        log.append(&"first".to_string()).unwrap();
        let committed = std::fs::metadata(&path).unwrap().len();

        // A write that died after the length prefix, with the log still open.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(&[0x65, 0x68]).unwrap();
        }

        let written = log.append(&"second".to_string()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed + written);
        drop(log);

        let (_log, entries) = FramedLog::open::<String>(&path, false).unwrap();
        assert_eq!(entries, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn rollback_restores_the_committed_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");

        let (log, _) = FramedLog::open::<u32>(&path, false).unwrap();
        log.append(&7u32).unwrap();
        let committed = std::fs::metadata(&path).unwrap().len();

        {
            let mut sink = log.sink.as_ref().unwrap().lock();
            sink.file.write_all(&[0xff; 3]).unwrap();
            sink.rollback().unwrap();
            assert_eq!(sink.committed, committed);
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed);

        log.append(&8u32).unwrap();
        drop(log);
        let (_log, entries) = FramedLog::open::<u32>(&path, false).unwrap();
        assert_eq!(entries, vec![7, 8]);
    }

    #[test]
    fn memory_log_accepts_appends() {
        let log = FramedLog::memory();
        assert!(log.path().is_none());
        assert!(log.append(&"hello").unwrap() > 0);
    }
}
