//! The append-only command log.
//!
//! Mutating commands are framed as RESP arrays, exactly as a client would
//! send them, so the log is replayable through the same router and
//! streamable to followers byte-for-byte. Appends land in a buffer that is
//! flushed past a size threshold or on demand; the tracked size includes
//! buffered bytes so offsets are stable the moment an append returns.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use meridian_common::error::{MeridianError, MeridianResult, ProtocolError};
use meridian_protocol::{codec, Value};

pub struct Aof {
    path: PathBuf,
    inner: Mutex<AofInner>,
    size: AtomicU64,
    flush_threshold: usize,
}

struct AofInner {
    file: File,
    buf: Vec<u8>,
}

impl Aof {
    pub fn open(path: &Path, flush_threshold: usize) -> MeridianResult<Aof> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(MeridianError::Io)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Aof {
            path: path.to_path_buf(),
            inner: Mutex::new(AofInner {
                file,
                buf: Vec::new(),
            }),
            size: AtomicU64::new(size),
            flush_threshold,
        })
    }

    /// Size of the log including not-yet-flushed bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn append(&self, args: &[String]) -> MeridianResult<()> {
        let mut frame = BytesMut::new();
        let values: Vec<Value> = args.iter().map(|a| Value::bulk(a.clone())).collect();
        codec::encode_value(&Value::Array(values), &mut frame);

        let mut inner = self.inner.lock();
        inner.buf.extend_from_slice(&frame);
        self.size.fetch_add(frame.len() as u64, Ordering::SeqCst);
        if inner.buf.len() > self.flush_threshold {
            Self::flush_locked(&mut inner)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> MeridianResult<()> {
        let mut inner = self.inner.lock();
        Self::flush_locked(&mut inner)
    }

    fn flush_locked(inner: &mut AofInner) -> MeridianResult<()> {
        if inner.buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut inner.buf);
        inner.file.write_all(&buf).map_err(MeridianError::Io)?;
        inner.file.flush().map_err(MeridianError::Io)?;
        Ok(())
    }

    /// Decode every logged command from the start of the file. A truncated
    /// tail (a crash mid-append) is tolerated: everything before it loads.
    pub fn load(&self) -> MeridianResult<Vec<Vec<String>>> {
        self.flush()?;
        let mut data = Vec::new();
        File::open(&self.path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(MeridianError::Io)?;

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            match codec::decode_value(&data[pos..]) {
                Ok((Value::Array(items), consumed)) => {
                    let args: Vec<String> = items
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect();
                    if args.len() != items.len() {
                        return Err(
                            ProtocolError::Invalid("non-string aof entry".into()).into()
                        );
                    }
                    entries.push(args);
                    pos += consumed;
                }
                Ok((_, _)) => {
                    return Err(ProtocolError::Invalid("non-array aof entry".into()).into());
                }
                Err(ProtocolError::Truncated { .. }) => {
                    tracing::warn!(
                        "aof has a truncated tail at offset {}; ignoring {} bytes",
                        pos,
                        data.len() - pos
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }

    /// Discard the whole log. Used when a follower resyncs from a leader
    /// snapshot and its local history no longer lines up.
    pub fn reset(&self) -> MeridianResult<()> {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.file.set_len(0).map_err(MeridianError::Io)?;
        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Read up to `max` raw bytes starting at `offset`, for streaming to a
    /// follower. Flushes first so the on-disk bytes cover the full size.
    pub fn read_at(&self, offset: u64, max: usize) -> MeridianResult<Vec<u8>> {
        self.flush()?;
        let mut file = File::open(&self.path).map_err(MeridianError::Io)?;
        file.seek(SeekFrom::Start(offset)).map_err(MeridianError::Io)?;
        let mut buf = vec![0u8; max];
        let n = file.read(&mut buf).map_err(MeridianError::Io)?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_append_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let aof = Aof::open(&path, 16).unwrap();
        aof.append(&entry(&["set", "fleet", "truck1", "POINT", "33", "-115"]))
            .unwrap();
        aof.append(&entry(&["del", "fleet", "truck1"])).unwrap();
        aof.flush().unwrap();

        let loaded = aof.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0][0], "set");
        assert_eq!(loaded[1], entry(&["del", "fleet", "truck1"]));
    }

    #[test]
    fn test_size_counts_buffered_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let aof = Aof::open(&path, 1 << 20).unwrap();
        assert_eq!(aof.size(), 0);
        aof.append(&entry(&["set", "k", "i", "STRING", "v"])).unwrap();
        let size = aof.size();
        assert!(size > 0);
        // Not flushed yet, but the size already covers the entry.
        assert!(std::fs::metadata(&path).unwrap().len() < size);
        aof.flush().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_truncated_tail_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        {
            let aof = Aof::open(&path, 16).unwrap();
            aof.append(&entry(&["set", "k", "a", "STRING", "one"])).unwrap();
            aof.append(&entry(&["set", "k", "b", "STRING", "two"])).unwrap();
            aof.flush().unwrap();
        }
        // Chop a few bytes off the tail.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        let aof = Aof::open(&path, 16).unwrap();
        let loaded = aof.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0][2], "a");
    }

    #[test]
    fn test_read_at_streams_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let aof = Aof::open(&path, 1 << 20).unwrap();
        aof.append(&entry(&["set", "k", "a", "STRING", "one"])).unwrap();
        let first = aof.size();
        aof.append(&entry(&["set", "k", "b", "STRING", "two"])).unwrap();

        let tail = aof.read_at(first, 4096).unwrap();
        let (value, _) = codec::decode_value(&tail).unwrap();
        match value {
            Value::Array(items) => assert_eq!(items[2].as_str(), Some("b")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
