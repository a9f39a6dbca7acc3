//! The append-only record log: a sequence of numbered segment files that
//! together form one logical byte stream.
//!
//! Segments are named `%016x.log`, the hex name being the logical position
//! at which the segment starts. Each record is framed as
//! `[kind: u8][len: varint][crc32(payload): u32 BE][payload]`.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use integer_encoding::VarInt;
use log::{debug, error, info};
use parking_lot::{Mutex, MutexGuard};

use crate::records::RecordKind;
use crate::{Result, StoreError};

/// Span of one log segment in the logical position space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    /// Starting byte offset of the segment in the logical append stream.
    pub position: u64,
    /// End of the segment: `position + size`.
    pub limit: u64,
}

/// Invoked with the new segment's starting position whenever the appender
/// rotates to a fresh file. Called with the appender lock held, so the
/// callback must not append.
pub(crate) type RotateCallback = Box<dyn Fn(u64) + Send + Sync>;

struct Appender {
    writer: BufWriterWithPos<File>,
    /// Logical position at which the current tail file starts.
    base: u64,
}

/// Persistent, numbered, append-only typed byte stream.
pub(crate) struct RecordLog {
    dir: PathBuf,
    log_size: u64,
    write_buffer_size: usize,
    appender: Mutex<Appender>,
    /// `position -> limit` for every live segment, tail included.
    segments: Mutex<BTreeMap<u64, u64>>,
    readers: DashMap<u64, BufReaderWithPos<File>>,
    appender_limit: AtomicU64,
    flushed_limit: AtomicU64,
    on_rotate: Mutex<Option<RotateCallback>>,
}

impl RecordLog {
    /// Scan `dir` for segments and open the tail for appending. Creates the
    /// first segment when the directory holds none.
    pub(crate) fn open(dir: impl Into<PathBuf>, log_size: u64, write_buffer_size: usize) -> Result<RecordLog> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let positions = sorted_segment_positions(&dir)?;
        let mut segments = BTreeMap::new();
        for &position in &positions {
            let size = fs::metadata(segment_path(&dir, position))?.len();
            segments.insert(position, position + size);
        }

        let tail = segments.iter().next_back().map(|(&base, &limit)| (base, limit));
        let (base, limit) = match tail {
            Some(tail) => tail,
            None => {
                File::create(segment_path(&dir, 0))?;
                segments.insert(0, 0);
                (0, 0)
            }
        };

        let tail = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&dir, base))?;
        let writer = BufWriterWithPos::with_capacity(write_buffer_size, tail)?;
        debug!(
            "opened record log in {:?}: {} segment(s), limit {}",
            dir,
            segments.len(),
            limit
        );

        Ok(RecordLog {
            dir,
            log_size,
            write_buffer_size,
            appender: Mutex::new(Appender { writer, base }),
            segments: Mutex::new(segments),
            readers: DashMap::new(),
            appender_limit: AtomicU64::new(limit),
            flushed_limit: AtomicU64::new(limit),
            on_rotate: Mutex::new(None),
        })
    }

    pub(crate) fn set_rotate_callback(&self, callback: RotateCallback) {
        *self.on_rotate.lock() = Some(callback);
    }

    /// Take the exclusive appender for a run of appends.
    pub(crate) fn appender(&self) -> AppendGuard<'_> {
        AppendGuard {
            log: self,
            inner: self.appender.lock(),
        }
    }

    /// One-shot append.
    #[cfg(test)]
    pub(crate) fn append(&self, kind: RecordKind, payload: &[u8]) -> Result<u64> {
        self.appender().append(kind, payload)
    }

    /// Highest logical position published to readers.
    pub(crate) fn appender_limit(&self) -> u64 {
        self.appender_limit.load(Ordering::Acquire)
    }

    /// Starting position of the segment currently being appended.
    pub(crate) fn appender_start(&self) -> u64 {
        self.appender.lock().base
    }

    /// The segment covering `pos`, if any.
    pub(crate) fn log_info(&self, pos: u64) -> Option<LogInfo> {
        let segments = self.segments.lock();
        segments
            .range(..=pos)
            .next_back()
            .filter(|&(_, &limit)| pos < limit)
            .map(|(&position, &limit)| LogInfo { position, limit })
    }

    /// All live segments in position order.
    pub(crate) fn segments(&self) -> Vec<LogInfo> {
        self.segments
            .lock()
            .iter()
            .map(|(&position, &limit)| LogInfo { position, limit })
            .collect()
    }

    /// Write the append buffer through to the page cache.
    pub(crate) fn flush(&self) -> Result<()> {
        let mut appender = self.appender.lock();
        appender.writer.flush()?;
        self.flushed_limit
            .store(self.appender_limit.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    /// Flush and fsync the tail file.
    pub(crate) fn sync(&self) -> Result<()> {
        let mut appender = self.appender.lock();
        appender.writer.flush()?;
        appender.writer.get_ref().sync_all()?;
        self.flushed_limit
            .store(self.appender_limit.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    /// Read the record starting at logical position `pos`.
    ///
    /// Returns the raw kind byte so replay can skip codes it does not know.
    pub(crate) fn read_record(&self, pos: u64) -> Result<(u8, Vec<u8>, u64)> {
        let info = self.locate_for_read(pos)?;
        self.with_reader(info.position, |reader| {
            reader.seek(SeekFrom::Start(pos - info.position))?;
            read_frame(reader, pos, info.limit - pos)
        })
    }

    /// Read the payload of the record at `pos`, validating that its framed
    /// length equals `len`.
    pub(crate) fn read_payload(&self, pos: u64, len: u32) -> Result<Vec<u8>> {
        let (_, payload, _) = self.read_record(pos)?;
        if payload.len() != len as usize {
            return Err(StoreError::Corrupt {
                position: pos,
                reason: format!("expected {} payload bytes, found {}", len, payload.len()),
            });
        }
        Ok(payload)
    }

    /// Remove a whole segment. Callers must have proved it holds no live
    /// references and sits below the snapshot boundary.
    pub(crate) fn delete(&self, position: u64) -> Result<()> {
        let path = segment_path(&self.dir, position);
        self.readers.remove(&position);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("{:?} cannot be deleted: {}", path, e);
                return Err(e.into());
            }
        }
        self.segments.lock().remove(&position);
        info!("deleted log segment {:016x}.log", position);
        Ok(())
    }

    /// Discard everything at and after `pos`: later segments are removed
    /// and the containing file is cut short. Used when replay hits an
    /// unreadable record.
    pub(crate) fn truncate(&self, pos: u64) -> Result<()> {
        let mut appender = self.appender.lock();
        appender.writer.flush()?;

        if pos >= self.appender_limit.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut segments = self.segments.lock();
        let base = match segments.range(..=pos).next_back().map(|(&b, _)| b) {
            Some(base) => base,
            None => {
                return Err(StoreError::StringError(format!(
                    "cannot truncate at {}: no segment covers it",
                    pos
                )))
            }
        };

        let later: Vec<u64> = segments.range(base + 1..).map(|(&b, _)| b).collect();
        for position in later {
            let path = segment_path(&self.dir, position);
            self.readers.remove(&position);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            segments.remove(&position);
        }

        let path = segment_path(&self.dir, base);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(pos - base)?;
        file.sync_all()?;
        self.readers.remove(&base);
        segments.insert(base, pos);
        drop(segments);

        let tail = OpenOptions::new().append(true).open(&path)?;
        appender.writer = BufWriterWithPos::with_capacity(self.write_buffer_size, tail)?;
        appender.base = base;
        self.appender_limit.store(pos, Ordering::Release);
        self.flushed_limit.store(pos, Ordering::Release);
        Ok(())
    }

    fn locate_for_read(&self, pos: u64) -> Result<LogInfo> {
        // Reads above the flushed watermark must drain the append buffer
        // first; everything below is already visible in the file.
        if pos >= self.flushed_limit.load(Ordering::Acquire) {
            if pos >= self.appender_limit.load(Ordering::Acquire) {
                return Err(StoreError::StringError(format!(
                    "read at {} beyond appender limit",
                    pos
                )));
            }
            self.flush()?;
        }
        self.log_info(pos).ok_or_else(|| StoreError::StringError(format!(
            "no log segment covers position {}",
            pos
        )))
    }

    fn with_reader<T>(
        &self,
        position: u64,
        f: impl FnOnce(&mut BufReaderWithPos<File>) -> Result<T>,
    ) -> Result<T> {
        if !self.readers.contains_key(&position) {
            let file = File::open(segment_path(&self.dir, position))?;
            self.readers.insert(position, BufReaderWithPos::new(file)?);
        }
        let mut reader = self
            .readers
            .get_mut(&position)
            .ok_or_else(|| StoreError::StringError(format!(
                "log segment {:016x} disappeared during read",
                position
            )))?;
        f(reader.value_mut())
    }
}

/// Exclusive hold on the appender, so a unit of work's records land
/// contiguously and in order.
pub(crate) struct AppendGuard<'a> {
    log: &'a RecordLog,
    inner: MutexGuard<'a, Appender>,
}

impl AppendGuard<'_> {
    /// Append one framed record; returns its logical position.
    pub(crate) fn append(&mut self, kind: RecordKind, payload: &[u8]) -> Result<u64> {
        let len_bytes = (payload.len() as u64).encode_var_vec();
        let frame_len = 1 + len_bytes.len() as u64 + 4 + payload.len() as u64;

        if self.inner.writer.pos > 0 && self.inner.writer.pos + frame_len > self.log.log_size {
            self.rotate()?;
        }

        let pos = self.inner.base + self.inner.writer.pos;
        let crc = crc32fast::hash(payload);
        self.inner.writer.write_all(&[kind as u8])?;
        self.inner.writer.write_all(&len_bytes)?;
        self.inner.writer.write_all(&crc.to_be_bytes())?;
        self.inner.writer.write_all(payload)?;

        let limit = pos + frame_len;
        self.log.segments.lock().insert(self.inner.base, limit);
        self.log.appender_limit.store(limit, Ordering::Release);
        Ok(pos)
    }

    /// Drain the append buffer to the page cache.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.inner.writer.flush()?;
        self.log.flushed_limit.store(
            self.log.appender_limit.load(Ordering::Acquire),
            Ordering::Release,
        );
        Ok(())
    }

    /// Flush and fsync the tail file.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.inner.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.inner.writer.flush()?;
        self.inner.writer.get_ref().sync_all()?;

        let base = self.log.appender_limit.load(Ordering::Acquire);
        let path = segment_path(&self.log.dir, base);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.inner.writer = BufWriterWithPos::with_capacity(self.log.write_buffer_size, file)?;
        self.inner.base = base;
        self.log.segments.lock().insert(base, base);
        self.log
            .flushed_limit
            .store(base, Ordering::Release);
        info!("rotated record log to segment {:016x}.log", base);

        if let Some(callback) = self.log.on_rotate.lock().as_ref() {
            callback(base);
        }
        Ok(())
    }
}

fn read_frame(
    reader: &mut BufReaderWithPos<File>,
    pos: u64,
    available: u64,
) -> Result<(u8, Vec<u8>, u64)> {
    let corrupt = |reason: String| StoreError::Corrupt {
        position: pos,
        reason,
    };

    let mut kind = [0u8; 1];
    reader
        .read_exact(&mut kind)
        .map_err(|e| corrupt(format!("kind byte: {}", e)))?;

    let mut len_buf = [0u8; 10];
    let mut n = 0;
    loop {
        let mut byte = [0u8; 1];
        reader
            .read_exact(&mut byte)
            .map_err(|e| corrupt(format!("length varint: {}", e)))?;
        len_buf[n] = byte[0];
        n += 1;
        if byte[0] & 0x80 == 0 {
            break;
        }
        if n == len_buf.len() {
            return Err(corrupt("length varint too long".to_owned()));
        }
    }
    let (len, _) = u64::decode_var(&len_buf[..n])
        .ok_or_else(|| corrupt("length varint malformed".to_owned()))?;

    let header_len = 1 + n as u64 + 4;
    if header_len + len > available {
        return Err(corrupt(format!(
            "length {} overruns segment by {}",
            len,
            header_len + len - available
        )));
    }

    let mut crc_buf = [0u8; 4];
    reader
        .read_exact(&mut crc_buf)
        .map_err(|e| corrupt(format!("checksum: {}", e)))?;
    let expected = u32::from_be_bytes(crc_buf);

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| corrupt(format!("payload: {}", e)))?;

    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(corrupt(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            expected, actual
        )));
    }

    Ok((kind[0], payload, pos + header_len + len))
}

/// Return the sorted starting positions of the segments in `dir`.
fn sorted_segment_positions(path: impl AsRef<Path>) -> Result<Vec<u64>> {
    let mut positions: Vec<u64> = fs::read_dir(&path)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_file() && path.extension() == Some("log".as_ref()))
        .flat_map(|path| {
            path.file_stem()
                .and_then(OsStr::to_str)
                .map(|stem| u64::from_str_radix(stem, 16))
        })
        .flatten()
        .collect();

    positions.sort_unstable();

    Ok(positions)
}

/// join path: {dir}/{position as %016x}.log
fn segment_path(dir: &Path, position: u64) -> PathBuf {
    dir.join(format!("{:016x}.log", position))
}

/// A `BufReader` that tracks the position it has read to.
pub(crate) struct BufReaderWithPos<R: Read + Seek> {
    reader: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> BufReaderWithPos<R> {
    fn new(mut inner: R) -> Result<Self> {
        let pos = inner.stream_position()?;
        Ok(BufReaderWithPos {
            reader: BufReader::new(inner),
            pos,
        })
    }
}

impl<R: Read + Seek> Read for BufReaderWithPos<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R: Read + Seek> Seek for BufReaderWithPos<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// A `BufWriter` that tracks the position it has written to.
struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    fn with_capacity(capacity: usize, mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::with_capacity(capacity, inner),
            pos,
        })
    }

    fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &Path) -> RecordLog {
        RecordLog::open(dir, 256, 4096).unwrap()
    }

    #[test]
    fn appends_read_back_across_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        let mut positions = Vec::new();
        for i in 0..20u8 {
            let payload = vec![i; 40];
            positions.push((log.append(RecordKind::AddMessage, &payload).unwrap(), payload));
        }
        assert!(log.segments().len() > 1, "256-byte limit must rotate");

        for (pos, payload) in positions {
            let (kind, read, _) = log.read_record(pos).unwrap();
            assert_eq!(kind, RecordKind::AddMessage as u8);
            assert_eq!(read, payload);
        }
    }

    #[test]
    fn logical_positions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first;
        let second;
        {
            let log = open_log(dir.path());
            first = log.append(RecordKind::AddQueue, b"one").unwrap();
            log.flush().unwrap();
        }
        {
            let log = open_log(dir.path());
            second = log.append(RecordKind::AddQueue, b"two").unwrap();
            assert!(second > first);
            let (_, payload, next) = log.read_record(first).unwrap();
            assert_eq!(payload, b"one");
            assert_eq!(next, second);
            log.flush().unwrap();
        }
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let pos = log.append(RecordKind::MapEntry, b"payload-bytes").unwrap();
        log.flush().unwrap();
        drop(log);

        // Flip one payload byte on disk.
        let path = dir.path().join(format!("{:016x}.log", 0));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let log = open_log(dir.path());
        match log.read_record(pos) {
            Err(StoreError::Corrupt { position, .. }) => assert_eq!(position, pos),
            other => panic!("expected corrupt record, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncate_discards_tail_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let first = log.append(RecordKind::AddMessage, b"keep").unwrap();
        let (_, _, cut) = {
            log.flush().unwrap();
            log.read_record(first).unwrap()
        };
        log.append(RecordKind::AddMessage, b"drop-a").unwrap();
        log.append(RecordKind::AddMessage, b"drop-b").unwrap();

        log.truncate(cut).unwrap();
        assert_eq!(log.appender_limit(), cut);
        assert!(log.read_record(cut).is_err());

        let replacement = log.append(RecordKind::AddMessage, b"after").unwrap();
        assert_eq!(replacement, cut);
        let (_, payload, _) = log.read_record(replacement).unwrap();
        assert_eq!(payload, b"after");
    }
}
