//! File-backed segmented log
//!
//! A log directory holds one file per segment, named after the first
//! offset it contains (`00000000000000000001.log`). Records are framed as
//!
//! ```text
//! [body_len:4][offset:8][flags:1][crc32:4][body:N]
//! ```
//!
//! where the CRC covers offset + flags + body. When flag bit 0 is set the
//! body is `[payload_len:4][payload][metadata]`, otherwise it is the
//! payload alone. On open every segment is scanned; a torn or corrupt
//! record at the tail of the last segment is truncated away.

use super::{LocalLog, LogEntry, LogOffset};
use crate::{Error, Result};
use bytes::Bytes;
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 17;
const FLAG_METADATA: u8 = 0x01;
const SEGMENT_SUFFIX: &str = "log";

/// Local log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Roll to a new segment once the active one reaches this many bytes
    pub segment_size: u64,
    /// fsync every append before acknowledging it
    pub sync_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            segment_size: 1023 * 200,
            sync_on_append: true,
        }
    }
}

impl LogConfig {
    /// Configuration rooted at `dir` with default sizing
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the segment roll size
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }
}

struct Segment {
    base: LogOffset,
    path: PathBuf,
    /// File position of each record, indexed by `offset - base`
    positions: Vec<u64>,
    len: u64,
}

impl Segment {
    fn last_offset(&self) -> Option<LogOffset> {
        if self.positions.is_empty() {
            None
        } else {
            Some(self.base + self.positions.len() as u64 - 1)
        }
    }
}

struct Inner {
    segments: BTreeMap<LogOffset, Segment>,
    active: Option<File>,
    highest: LogOffset,
}

/// Durable [`LocalLog`] backed by segment files
pub struct SegmentedLog {
    config: LogConfig,
    inner: Mutex<Inner>,
}

impl SegmentedLog {
    /// Open (or create) a log directory, recovering its index
    pub fn open(config: LogConfig) -> Result<Self> {
        if config.segment_size == 0 {
            return Err(Error::config("segment_size must be at least 1"));
        }
        fs::create_dir_all(&config.dir)?;

        let mut bases = Vec::new();
        for dir_entry in fs::read_dir(&config.dir)? {
            let path = dir_entry?.path();
            if let Some(base) = parse_segment_name(&path) {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut highest = 0;
        let last_index = bases.len().saturating_sub(1);
        for (i, base) in bases.into_iter().enumerate() {
            if highest != 0 && base != highest + 1 {
                return Err(Error::wal(format!(
                    "Segment gap: segment {} does not follow offset {}",
                    base, highest
                )));
            }
            let path = segment_path(&config.dir, base);
            let segment = scan_segment(&path, base, i == last_index)?;
            highest = segment.last_offset().unwrap_or(base - 1);
            segments.insert(base, segment);
        }

        let active = match segments.values().next_back() {
            Some(segment) => Some(OpenOptions::new().append(true).open(&segment.path)?),
            None => None,
        };

        tracing::info!(
            "Opened log {:?}: {} segments, highest offset {}",
            config.dir,
            segments.len(),
            highest
        );

        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                segments,
                active,
                highest,
            }),
        })
    }

    /// Log configuration
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Number of segment files
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    fn write_record(
        &self,
        inner: &mut Inner,
        offset: LogOffset,
        payload: &[u8],
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let needs_roll = match inner.segments.values().next_back() {
            Some(segment) => {
                segment.len >= self.config.segment_size && !segment.positions.is_empty()
            }
            None => true,
        };
        if needs_roll {
            let path = segment_path(&self.config.dir, offset);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            inner.segments.insert(
                offset,
                Segment {
                    base: offset,
                    path,
                    positions: Vec::new(),
                    len: 0,
                },
            );
            inner.active = Some(file);
            tracing::debug!("Rolled log segment at offset {}", offset);
        }

        let record = encode_record(offset, payload, metadata);
        let Inner {
            segments, active, ..
        } = inner;
        let (Some(segment), Some(file)) = (segments.values_mut().next_back(), active.as_mut())
        else {
            return Err(Error::internal("No active log segment"));
        };

        let write = file.write_all(&record).and_then(|_| {
            if self.config.sync_on_append {
                file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = write {
            // Drop whatever part of the record reached the file.
            let _ = file.set_len(segment.len);
            return Err(e.into());
        }

        segment.positions.push(segment.len);
        segment.len += record.len() as u64;
        inner.highest = offset;
        Ok(())
    }
}

impl LocalLog for SegmentedLog {
    fn append(&self, payload: Bytes, metadata: Option<Bytes>) -> Result<LogOffset> {
        let mut inner = self.inner.lock();
        let offset = inner.highest + 1;
        self.write_record(&mut inner, offset, &payload, metadata.as_deref())?;
        Ok(offset)
    }

    fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        if entry.offset != inner.highest + 1 {
            return Err(Error::wal(format!(
                "Non-contiguous append: expected offset {}, got {}",
                inner.highest + 1,
                entry.offset
            )));
        }
        self.write_record(
            &mut inner,
            entry.offset,
            &entry.payload,
            entry.metadata.as_deref(),
        )
    }

    fn read_from(&self, from: LogOffset, max_entries: usize) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        if from > inner.highest || max_entries == 0 {
            return Ok(out);
        }

        let start_base = inner
            .segments
            .range(..=from)
            .next_back()
            .map(|(base, _)| *base)
            .unwrap_or(0);

        let mut next = from;
        for segment in inner.segments.range(start_base..).map(|(_, s)| s) {
            if segment.positions.is_empty() {
                continue;
            }
            next = next.max(segment.base);
            let mut index = (next - segment.base) as usize;
            if index >= segment.positions.len() {
                continue;
            }

            let mut file = File::open(&segment.path)?;
            file.seek(SeekFrom::Start(segment.positions[index]))?;
            while index < segment.positions.len() && out.len() < max_entries {
                let available = segment.len.saturating_sub(segment.positions[index]);
                let entry = read_record(&mut file, available)?.ok_or_else(|| {
                    Error::wal(format!("Truncated record in {:?}", segment.path))
                })?;
                if entry.offset != segment.base + index as u64 {
                    return Err(Error::wal(format!(
                        "Offset mismatch in {:?}: expected {}, found {}",
                        segment.path,
                        segment.base + index as u64,
                        entry.offset
                    )));
                }
                out.push(entry);
                index += 1;
            }
            if out.len() >= max_entries {
                break;
            }
            next = segment.base + segment.positions.len() as u64;
        }
        Ok(out)
    }

    fn highest_offset(&self) -> LogOffset {
        self.inner.lock().highest
    }

    fn oldest_offset(&self) -> LogOffset {
        let inner = self.inner.lock();
        inner
            .segments
            .values()
            .find(|s| !s.positions.is_empty())
            .map(|s| s.base)
            .unwrap_or(inner.highest + 1)
    }

    fn purge_before(&self, offset: LogOffset) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(active_base) = inner.segments.keys().next_back().copied() else {
            return Ok(0);
        };

        let doomed: Vec<LogOffset> = inner
            .segments
            .values()
            .filter(|s| s.base != active_base)
            .filter(|s| s.last_offset().is_none_or(|last| last < offset))
            .map(|s| s.base)
            .collect();

        let mut removed = 0;
        for base in doomed {
            if let Some(segment) = inner.segments.remove(&base) {
                fs::remove_file(&segment.path)?;
                removed += segment.positions.len() as u64;
                tracing::debug!("Purged log segment {:?}", segment.path);
            }
        }
        Ok(removed)
    }
}

fn segment_path(dir: &Path, base: LogOffset) -> PathBuf {
    dir.join(format!("{:020}.{}", base, SEGMENT_SUFFIX))
}

fn parse_segment_name(path: &Path) -> Option<LogOffset> {
    if path.extension()?.to_str()? != SEGMENT_SUFFIX {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .parse()
        .ok()
        .filter(|base: &LogOffset| *base > 0)
}

fn record_crc(offset: LogOffset, flags: u8, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&offset.to_le_bytes());
    hasher.update(&[flags]);
    hasher.update(body);
    hasher.finalize()
}

fn encode_record(offset: LogOffset, payload: &[u8], metadata: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + metadata.map_or(0, |m| m.len() + 4));
    let flags = match metadata {
        Some(meta) => {
            body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            body.extend_from_slice(payload);
            body.extend_from_slice(meta);
            FLAG_METADATA
        }
        None => {
            body.extend_from_slice(payload);
            0
        }
    };

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.push(flags);
    buf.extend_from_slice(&record_crc(offset, flags, &body).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Read one record; `Ok(None)` on a clean end of file.
///
/// `available` is the number of bytes between the record start and the
/// end of the segment; a header claiming more is treated as torn.
fn read_record<R: Read>(reader: &mut R, available: u64) -> Result<Option<LogEntry>> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        n if n < HEADER_LEN => return Err(Error::wal("Torn record header")),
        _ => {}
    }

    let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut offset_bytes = [0u8; 8];
    offset_bytes.copy_from_slice(&header[4..12]);
    let offset = u64::from_le_bytes(offset_bytes);
    let flags = header[12];
    let stored_crc = u32::from_le_bytes([header[13], header[14], header[15], header[16]]);

    if body_len as u64 > available.saturating_sub(HEADER_LEN as u64) {
        return Err(Error::wal(format!(
            "Record length {} overruns segment ({} bytes left)",
            body_len, available
        )));
    }
    let mut body = vec![0u8; body_len];
    if read_full(reader, &mut body)? < body_len {
        return Err(Error::wal("Torn record body"));
    }
    if record_crc(offset, flags, &body) != stored_crc {
        return Err(Error::wal(format!("CRC mismatch at offset {}", offset)));
    }

    let body = Bytes::from(body);
    let (payload, metadata) = if flags & FLAG_METADATA != 0 {
        if body.len() < 4 {
            return Err(Error::wal("Metadata record too short"));
        }
        let payload_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if 4 + payload_len > body.len() {
            return Err(Error::wal("Metadata record payload overruns body"));
        }
        (
            body.slice(4..4 + payload_len),
            Some(body.slice(4 + payload_len..)),
        )
    } else {
        (body, None)
    };

    Ok(Some(LogEntry {
        offset,
        payload,
        metadata,
    }))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn scan_segment(path: &Path, base: LogOffset, is_last: bool) -> Result<Segment> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = std::io::BufReader::new(&mut file);

    let mut positions = Vec::new();
    let mut pos = 0u64;
    loop {
        let expected = base + positions.len() as u64;
        match read_record(&mut reader, file_len.saturating_sub(pos)) {
            Ok(Some(entry)) if entry.offset == expected => {
                positions.push(pos);
                pos += (HEADER_LEN + encoded_body_len(&entry)) as u64;
            }
            Ok(None) => break,
            Ok(Some(entry)) => {
                if !is_last {
                    return Err(Error::wal(format!(
                        "Offset mismatch in {:?}: expected {}, found {}",
                        path, expected, entry.offset
                    )));
                }
                tracing::warn!(
                    "Unexpected offset {} in {:?} (expected {}), truncating",
                    entry.offset,
                    path,
                    expected
                );
                break;
            }
            Err(Error::Wal(reason)) if is_last => {
                tracing::warn!("Truncating torn tail of {:?} at {}: {}", path, pos, reason);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    drop(reader);

    if pos < file_len {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(pos)?;
        file.sync_all()?;
    }

    Ok(Segment {
        base,
        path: path.to_path_buf(),
        positions,
        len: pos,
    })
}

fn encoded_body_len(entry: &LogEntry) -> usize {
    match &entry.metadata {
        Some(meta) => 4 + entry.payload.len() + meta.len(),
        None => entry.payload.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::read_all_payloads;
    use tempfile::TempDir;

    fn open(dir: &TempDir, segment_size: u64) -> SegmentedLog {
        SegmentedLog::open(LogConfig::new(dir.path()).with_segment_size(segment_size)).unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 1024);

        assert_eq!(log.highest_offset(), 0);
        assert_eq!(log.oldest_offset(), 1);
        assert_eq!(log.append(Bytes::from_static(b"one"), None).unwrap(), 1);
        assert_eq!(
            log.append(
                Bytes::from_static(b"two"),
                Some(Bytes::from_static(b"meta"))
            )
            .unwrap(),
            2
        );

        let entries = log.read_from(1, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, "one");
        assert_eq!(entries[0].metadata, None);
        assert_eq!(entries[1].payload, "two");
        assert_eq!(entries[1].metadata.as_deref(), Some(&b"meta"[..]));
    }

    #[test]
    fn test_reopen_recovers_index() {
        let dir = TempDir::new().unwrap();
        {
            let log = open(&dir, 64);
            for i in 0..20 {
                log.append(Bytes::from(format!("message-{i}")), None).unwrap();
            }
            assert!(log.segment_count() > 1);
        }

        let log = open(&dir, 64);
        assert_eq!(log.highest_offset(), 20);
        let payloads = read_all_payloads(&log).unwrap();
        assert_eq!(payloads.len(), 20);
        assert_eq!(payloads[19], "message-19");
        assert_eq!(log.append(Bytes::from_static(b"next"), None).unwrap(), 21);
    }

    #[test]
    fn test_read_spans_segments() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 40);
        for i in 0..12 {
            log.append(Bytes::from(format!("m{i:02}")), None).unwrap();
        }

        let entries = log.read_from(3, 7).unwrap();
        let offsets: Vec<_> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let log = open(&dir, 1 << 20);
            log.append(Bytes::from_static(b"kept"), None).unwrap();
            log.append(Bytes::from_static(b"torn"), None).unwrap();
        }

        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();
        drop(file);

        let log = open(&dir, 1 << 20);
        assert_eq!(log.highest_offset(), 1);
        assert_eq!(read_all_payloads(&log).unwrap(), vec!["kept"]);
        assert_eq!(log.append(Bytes::from_static(b"again"), None).unwrap(), 2);
    }

    #[test]
    fn test_oversized_length_is_torn_tail() {
        let dir = TempDir::new().unwrap();
        {
            let log = open(&dir, 1 << 20);
            log.append(Bytes::from_static(b"kept"), None).unwrap();
        }

        // A garbage header claiming a ~4 GiB body after the good record
        let path = segment_path(dir.path(), 1);
        let good_len = fs::metadata(&path).unwrap().len();
        let mut header = vec![0u8; HEADER_LEN];
        header[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        header[4..12].copy_from_slice(&2u64.to_le_bytes());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&header).unwrap();
        file.write_all(b"junk").unwrap();
        drop(file);

        let log = open(&dir, 1 << 20);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(log.highest_offset(), 1);
        assert_eq!(read_all_payloads(&log).unwrap(), vec!["kept"]);
        assert_eq!(log.append(Bytes::from_static(b"next"), None).unwrap(), 2);
    }

    #[test]
    fn test_read_record_bounds_body_length() {
        let record = encode_record(7, b"payload", None);
        let mut reader = &record[..];
        assert!(read_record(&mut reader, record.len() as u64 - 1).is_err());

        let mut reader = &record[..];
        let entry = read_record(&mut reader, record.len() as u64)
            .unwrap()
            .unwrap();
        assert_eq!(entry.offset, 7);
        assert_eq!(entry.payload, "payload");
    }

    #[test]
    fn test_append_entry_requires_next_offset() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 1024);
        log.append_entry(&LogEntry::new(1, "a")).unwrap();
        assert!(log.append_entry(&LogEntry::new(5, "e")).is_err());
        log.append_entry(&LogEntry::new(2, "b")).unwrap();
        assert_eq!(log.highest_offset(), 2);
    }

    #[test]
    fn test_purge_keeps_active_segment() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 32);
        for i in 0..10 {
            log.append(Bytes::from(format!("entry-{i}")), None).unwrap();
        }
        let before = log.segment_count();
        assert!(before > 2);

        let removed = log.purge_before(log.highest_offset() + 1).unwrap();
        assert!(removed > 0);
        assert_eq!(log.segment_count(), 1);
        assert!(log.oldest_offset() > 1);
        assert_eq!(log.highest_offset(), 10);

        // The purged range is gone, the remainder is still readable
        let entries = log.read_from(1, 100).unwrap();
        assert_eq!(entries.first().map(|e| e.offset), Some(log.oldest_offset()));
        assert_eq!(entries.last().map(|e| e.offset), Some(10));
    }

    #[test]
    fn test_segment_names() {
        let path = segment_path(Path::new("/tmp/x"), 42);
        assert_eq!(parse_segment_name(&path), Some(42));
        assert_eq!(parse_segment_name(Path::new("/tmp/x/readme.txt")), None);
    }
}
