//! The client and recovery engine: startup replay, unit-of-work commits,
//! hard-link index snapshots, segment reclamation and reads.

mod commit;
mod dump;
mod writer;

pub use dump::DumpStats;

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::{IndexBackend, StoreConfig};
use crate::index::{Index, IndexKey};
use crate::keys;
use crate::ledger::LogRefLedger;
use crate::log::{LogInfo, RecordLog};
use crate::records::{
    decode_message_payload, CompletionCallback, Locator, LocatorCell, QueueEntryRange,
    QueueEntryRecord, QueueRecord, RecordKind, UnitOfWork,
};
use crate::{Result, StoreError};

use self::writer::{Task, WriteExecutor};

const DIRTY_INDEX_DIR: &str = "dirty.index";
const TEMP_INDEX_DIR: &str = "temp.index";
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A message to resolve in [`MessageStore::load_messages`].
#[derive(Debug, Clone)]
pub struct MessageLookup {
    /// Key of the message to load.
    pub msg_key: u64,
    /// Shared locator cell kept by the producer, tried before the index.
    pub locator: Option<LocatorCell>,
}

impl MessageLookup {
    /// Lookup by key alone.
    pub fn by_key(msg_key: u64) -> MessageLookup {
        MessageLookup {
            msg_key,
            locator: None,
        }
    }
}

/// Stop flag shared by every retry loop, with a cancellation-aware sleep.
#[derive(Default)]
pub(crate) struct ServiceState {
    stopping: Mutex<bool>,
    cond: Condvar,
}

impl ServiceState {
    fn request_stop(&self) {
        *self.stopping.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.stopping.lock()
    }

    /// Sleep for `timeout` unless stop is requested first. Returns whether
    /// the service is stopping.
    fn sleep(&self, timeout: Duration) -> bool {
        let mut stopping = self.stopping.lock();
        if !*stopping {
            self.cond.wait_for(&mut stopping, timeout);
        }
        *stopping
    }
}

/// Everything that exists only while the store is open. Dropping it closes
/// the index and the log.
pub(crate) struct OpenState {
    pub(crate) log: RecordLog,
    /// `None` only transiently while a snapshot has the index closed.
    pub(crate) index: Option<Index>,
    pub(crate) ledger: Mutex<LogRefLedger>,
    pub(crate) last_snapshot_pos: u64,
}

impl OpenState {
    pub(crate) fn index(&self) -> Result<&Index> {
        self.index.as_ref().ok_or(StoreError::Stopped)
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    backend: IndexBackend,
    pub(crate) service: ServiceState,
    /// The snapshot reader/writer lock. Every user operation holds the
    /// read side; only suspension (snapshot, gc, purge, stop) takes the
    /// write side, so during a snapshot the index file set is stable.
    state: RwLock<Option<OpenState>>,
}

/// The persistent message store.
///
/// Writers hand unit-of-work batches to [`store`](MessageStore::store);
/// they are committed in arrival order by a single writer thread. Readers
/// resolve messages through [`load_messages`](MessageStore::load_messages)
/// and browse queues through the cursor-backed listing calls.
pub struct MessageStore {
    inner: Arc<StoreInner>,
    executor: Mutex<Option<WriteExecutor>>,
}

impl MessageStore {
    /// Open the store in `config.directory`, recovering from whatever the
    /// last run left behind. Transient open failures are retried until
    /// [`stop`](MessageStore::stop) is called; configuration problems fail
    /// immediately.
    pub fn start(config: StoreConfig) -> Result<MessageStore> {
        let backend = config.validate()?;
        fs::create_dir_all(&config.directory)?;
        check_directory_writable(&config.directory)?;

        let inner = Arc::new(StoreInner {
            config,
            backend,
            service: ServiceState::default(),
            state: RwLock::new(None),
        });

        let state = inner.retry("store open", || inner.open_state())?;
        *inner.state.write() = Some(state);

        let executor = WriteExecutor::start(Arc::clone(&inner))?;
        info!("message store started in {:?}", inner.config.directory);
        Ok(MessageStore {
            inner,
            executor: Mutex::new(Some(executor)),
        })
    }

    /// Drain pending work, take a final snapshot and close. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if let Some(executor) = self.executor.lock().take() {
            drop(executor);
        } else {
            return Ok(());
        }

        if let Err(e) = self.snapshot_index() {
            warn!("final snapshot failed, recovery will replay the log: {}", e);
            let guard = self.inner.state.read();
            if let Some(state) = guard.as_ref() {
                if let Ok(index) = state.index() {
                    if let Err(e) = state.ledger.lock().save(index, true) {
                        warn!("could not persist ledger on close: {}", e);
                    }
                }
            }
        }

        self.inner.service.request_stop();
        *self.inner.state.write() = None;
        info!("message store stopped");
        Ok(())
    }

    /// Delete everything and reopen empty.
    pub fn purge(&self) -> Result<()> {
        let mut guard = self.inner.state.write();
        guard.take();

        let dir = &self.inner.config.directory;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        *guard = Some(self.inner.open_state()?);
        info!("store purged");
        Ok(())
    }

    /// Checkpoint the index: a consistent, hard-linked copy of the live
    /// index directory named by the log position it covers. Blocks readers
    /// and writers for the duration. Returns the covered position.
    pub fn snapshot_index(&self) -> Result<u64> {
        let mut guard = self.inner.state.write();
        let state = guard.as_mut().ok_or(StoreError::Stopped)?;
        self.inner.snapshot_locked(state)
    }

    /// Delete log segments that hold no live message references and whose
    /// content is already captured by the latest snapshot. Returns how many
    /// segments were removed.
    pub fn gc(&self) -> Result<usize> {
        let guard = self.inner.state.write();
        let state = guard.as_ref().ok_or(StoreError::Stopped)?;

        let appender_start = state.log.appender_start();
        let snapshot_covered = state
            .log
            .log_info(state.last_snapshot_pos)
            .map(|info| info.position)
            .unwrap_or(state.last_snapshot_pos);
        let boundary = appender_start.min(snapshot_covered);

        let ledger = state.ledger.lock();
        let mut deleted = 0;
        for info in state.log.segments() {
            if info.position < boundary && !ledger.is_referenced(info.position) {
                state.log.delete(info.position)?;
                deleted += 1;
            }
        }
        debug!("gc removed {} segment(s) below {:016x}", deleted, boundary);
        Ok(deleted)
    }

    /// Queue a batch of units of work for commit. Each unit's callback is
    /// invoked once it has been applied (durably, when it carries a
    /// callback and the store is configured `sync`).
    pub fn store(&self, uows: Vec<UnitOfWork>) -> Result<()> {
        self.submit(Task::Store(uows))
    }

    /// [`store`](MessageStore::store), then wait for the batch to commit.
    pub fn store_sync(&self, mut uows: Vec<UnitOfWork>) -> Result<()> {
        let last = match uows.last_mut() {
            Some(last) => last,
            None => return Ok(()),
        };
        let (callback, done) = wait_callback();
        let chained = last.on_complete.take();
        last.on_complete = Some(Box::new(move |result| {
            let forwarded = share_result(&result);
            if let Some(previous) = chained {
                previous(result);
            }
            callback(forwarded);
        }));
        self.store(uows)?;
        done.recv().map_err(|_| StoreError::Stopped)?
    }

    /// Record a queue. Overwrites the metadata of an existing queue key.
    pub fn add_queue(&self, record: QueueRecord, callback: Option<CompletionCallback>) -> Result<()> {
        self.submit(Task::AddQueue(record, callback))
    }

    /// [`add_queue`](MessageStore::add_queue), then wait.
    pub fn add_queue_sync(&self, record: QueueRecord) -> Result<()> {
        let (callback, done) = wait_callback();
        self.add_queue(record, Some(callback))?;
        done.recv().map_err(|_| StoreError::Stopped)?
    }

    /// Remove a queue and every entry still on it, releasing the ledger
    /// references the entries held.
    pub fn remove_queue(&self, queue_key: u64, callback: Option<CompletionCallback>) -> Result<()> {
        self.submit(Task::RemoveQueue(queue_key, callback))
    }

    /// [`remove_queue`](MessageStore::remove_queue), then wait.
    pub fn remove_queue_sync(&self, queue_key: u64) -> Result<()> {
        let (callback, done) = wait_callback();
        self.remove_queue(queue_key, Some(callback))?;
        done.recv().map_err(|_| StoreError::Stopped)?
    }

    /// Resolve message payloads. Each request tries its locator cell, then
    /// the index, then reads the log. All lookups run under one index
    /// snapshot; misses are retried once under a fresh snapshot to absorb
    /// the race with units of work committed while we read.
    pub fn load_messages(&self, requests: &[MessageLookup]) -> Result<Vec<Option<Vec<u8>>>> {
        self.inner.with_state(|state| {
            let index = state.index()?;
            let mut results = vec![None; requests.len()];
            let mut missed = Vec::new();
            {
                let snapshot = index.snapshot();
                for (i, request) in requests.iter().enumerate() {
                    match load_one(state, index, Some(&snapshot), request)? {
                        Some(payload) => results[i] = Some(payload),
                        None => missed.push(i),
                    }
                }
            }
            if !missed.is_empty() {
                let snapshot = index.snapshot();
                for i in missed {
                    results[i] = load_one(state, index, Some(&snapshot), &requests[i])?;
                }
            }
            Ok(results)
        })
    }

    /// All queues, in key order.
    pub fn list_queues(&self) -> Result<Vec<QueueRecord>> {
        self.inner.with_state(|state| {
            let index = state.index()?;
            let snapshot = index.snapshot();
            let mut queues = Vec::new();
            index.scan_prefix(Some(&snapshot), &[keys::QUEUE_PREFIX], |_, value| {
                queues.push(bincode::deserialize(&value)?);
                Ok(true)
            })?;
            Ok(queues)
        })
    }

    /// Look up one queue.
    pub fn get_queue(&self, queue_key: u64) -> Result<Option<QueueRecord>> {
        self.inner.with_state(|state| {
            let index = state.index()?;
            match index.get(None, &keys::queue_key(queue_key))? {
                Some(value) => Ok(Some(bincode::deserialize(&value)?)),
                None => Ok(None),
            }
        })
    }

    /// Walk a queue's entries, grouping up to `limit` entries per range and
    /// aggregating count, byte size and the smallest non-zero expiration.
    pub fn list_queue_entry_groups(&self, queue_key: u64, limit: u32) -> Result<Vec<QueueEntryRange>> {
        if limit == 0 {
            return Err(StoreError::StringError("group limit must be non-zero".to_owned()));
        }
        self.inner.with_state(|state| {
            let index = state.index()?;
            let snapshot = index.snapshot();
            let mut groups = Vec::new();
            let mut current: Option<QueueEntryRange> = None;
            index.scan_prefix(Some(&snapshot), &keys::entry_prefix(queue_key), |key, value| {
                let seq = match keys::decode_entry_key(&key) {
                    Some((_, seq)) => seq,
                    None => return Ok(true),
                };
                let entry: QueueEntryRecord = bincode::deserialize(&value)?;
                let range = current.get_or_insert_with(|| QueueEntryRange {
                    first_entry_seq: seq,
                    last_entry_seq: seq,
                    count: 0,
                    size: 0,
                    expiration: 0,
                });
                range.last_entry_seq = seq;
                range.count += 1;
                range.size += entry.size as u64;
                if entry.expiration != 0
                    && (range.expiration == 0 || entry.expiration < range.expiration)
                {
                    range.expiration = entry.expiration;
                }
                if range.count >= limit {
                    if let Some(full) = current.take() {
                        groups.push(full);
                    }
                }
                Ok(true)
            })?;
            if let Some(rest) = current {
                groups.push(rest);
            }
            Ok(groups)
        })
    }

    /// The entries of one queue with `first <= entry_seq <= last`.
    pub fn get_queue_entries(&self, queue_key: u64, first: u64, last: u64) -> Result<Vec<QueueEntryRecord>> {
        self.inner.with_state(|state| {
            let index = state.index()?;
            let snapshot = index.snapshot();
            let mut entries = Vec::new();
            index.scan_from(Some(&snapshot), &keys::entry_key(queue_key, first), |key, value| {
                match keys::decode_entry_key(&key) {
                    Some((queue, seq)) if queue == queue_key && seq <= last => {
                        entries.push(bincode::deserialize(&value)?);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })?;
            Ok(entries)
        })
    }

    /// Greatest message key in the index, `0` when there are none.
    pub fn get_last_message_key(&self) -> Result<u64> {
        self.inner.with_state(|state| {
            let last = state.index()?.last_key_with_prefix(&[keys::MESSAGE_PREFIX])?;
            Ok(last.and_then(|key| keys::decode_u64_key(&key)).unwrap_or(0))
        })
    }

    /// Greatest queue key in the index, `0` when there are none.
    pub fn get_last_queue_key(&self) -> Result<u64> {
        self.inner.with_state(|state| {
            let last = state.index()?.last_key_with_prefix(&[keys::QUEUE_PREFIX])?;
            Ok(last.and_then(|key| keys::decode_u64_key(&key)).unwrap_or(0))
        })
    }

    /// Look up a value in the auxiliary user map.
    pub fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner
            .with_state(|state| state.index()?.get(None, &keys::map_key(user_key)))
    }

    /// Write the whole store as a length-framed dump stream.
    pub fn export(&self, out: &mut dyn Write) -> Result<DumpStats> {
        dump::export(&self.inner, out)
    }

    /// Replace the store contents with a dump stream previously produced by
    /// [`export`](MessageStore::export). Purges first, then rebuilds and
    /// takes a snapshot. Concurrent writers must be quiesced.
    pub fn import(&self, input: &mut dyn Read) -> Result<DumpStats> {
        dump::import(self, &self.inner, input)
    }

    /// The live log segments, in position order.
    pub fn segments(&self) -> Result<Vec<LogInfo>> {
        self.inner.with_state(|state| Ok(state.log.segments()))
    }

    /// Sorted `(segment position, live references)` pairs from the ledger.
    pub fn segment_refs(&self) -> Result<Vec<(u64, u32)>> {
        self.inner.with_state(|state| Ok(state.ledger.lock().counts()))
    }

    fn submit(&self, task: Task) -> Result<()> {
        let executor = self.executor.lock();
        match executor.as_ref() {
            Some(executor) => executor.submit(task),
            None => Err(StoreError::Stopped),
        }
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        // Join the writer so queued work is not silently lost. No snapshot:
        // an unclean drop recovers through replay, and tests rely on that.
        self.executor.lock().take();
    }
}

impl StoreInner {
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&OpenState) -> Result<T>) -> Result<T> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(StoreError::Stopped)?;
        f(state)
    }

    /// Retry `f` every second until it succeeds or stop is requested. The
    /// first failure is logged once; recovery is logged when it happens.
    /// This rides out transient conditions such as a full disk.
    pub(crate) fn retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut logged = false;
        loop {
            match f() {
                Ok(value) => {
                    if logged {
                        info!("{} recovered", what);
                    }
                    return Ok(value);
                }
                Err(e) if self.service.is_stopping() => return Err(e),
                Err(e) => {
                    if !logged {
                        error!("{} failed, retrying until it clears: {}", what, e);
                        logged = true;
                    }
                    if self.service.sleep(RETRY_DELAY) {
                        return Err(StoreError::Stopped);
                    }
                }
            }
        }
    }

    /// The startup protocol: elect the newest snapshot, rebuild
    /// `dirty.index` from it via hard links, open the log and replay the
    /// suffix the snapshot does not cover.
    fn open_state(&self) -> Result<OpenState> {
        let dir = &self.config.directory;

        let mut snapshots = sorted_snapshot_positions(dir)?;
        let last_snapshot = snapshots.pop();
        for stale in snapshots {
            info!("removing stale snapshot {:016x}.index", stale);
            fs::remove_dir_all(snapshot_path(dir, stale))?;
        }
        let temp = dir.join(TEMP_INDEX_DIR);
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }

        let dirty = dir.join(DIRTY_INDEX_DIR);
        if dirty.exists() {
            fs::remove_dir_all(&dirty)?;
        }
        fs::create_dir_all(&dirty)?;
        if let Some(position) = last_snapshot {
            link_dir_contents(&snapshot_path(dir, position), &dirty)?;
        }
        let last_snapshot_pos = last_snapshot.unwrap_or(0);

        let index = Index::open(&dirty, &self.config, self.backend)?;
        let ledger = LogRefLedger::load(&index)?;
        index.put(keys::DIRTY_KEY, &[1], true)?;

        let log = RecordLog::open(dir, self.config.log_size, self.config.log_write_buffer_size)?;
        log.set_rotate_callback(Box::new(|position| {
            debug!("appender rotated to segment {:016x}", position);
        }));

        let state = OpenState {
            log,
            index: Some(index),
            ledger: Mutex::new(ledger),
            last_snapshot_pos,
        };
        self.replay(&state, last_snapshot_pos)?;
        Ok(state)
    }

    /// Rebuild index state from the log records in `[from, appender_limit)`.
    /// Stops at the first unreadable record and truncates the tail there;
    /// any other failure aborts the open so it can be retried.
    fn replay(&self, state: &OpenState, from: u64) -> Result<()> {
        let index = state.index()?;
        let mut ledger = state.ledger.lock();
        let limit = state.log.appender_limit();
        let mut pos = from;
        let mut replayed = 0u64;

        while pos < limit {
            let (kind, payload, next) = match state.log.read_record(pos) {
                Ok(record) => record,
                Err(StoreError::Corrupt { position, reason }) => {
                    warn!("log tail unreadable at {}, truncating: {}", position, reason);
                    state.log.truncate(pos)?;
                    break;
                }
                Err(e) => return Err(e),
            };
            match apply_replay(state, index, &mut ledger, kind, &payload, pos) {
                Ok(()) => {}
                Err(StoreError::Codec(e)) => {
                    warn!("log tail undecodable at {}, truncating: {}", pos, e);
                    state.log.truncate(pos)?;
                    break;
                }
                Err(e) => return Err(e),
            }
            pos = next;
            replayed += 1;
        }

        if replayed > 0 {
            info!("replayed {} record(s) from position {}", replayed, from);
        }
        Ok(())
    }

    /// The snapshot protocol, entered with the write side of the snapshot
    /// lock held. If anything fails after the index is closed, `temp.index`
    /// is discarded and the prior snapshot stays authoritative.
    pub(crate) fn snapshot_locked(&self, state: &mut OpenState) -> Result<u64> {
        let dir = &self.config.directory;
        state.log.sync()?;
        let limit = state.log.appender_limit();

        if limit == state.last_snapshot_pos && snapshot_path(dir, limit).exists() {
            return Ok(limit);
        }

        {
            let index = state.index()?;
            state.ledger.lock().save(index, false)?;
            index.put(keys::DIRTY_KEY, &[0], true)?;
        }
        // Close the index so its file set is stable while we link it.
        state.index.take();

        let dirty = dir.join(DIRTY_INDEX_DIR);
        let promoted = (|| -> Result<()> {
            let temp = dir.join(TEMP_INDEX_DIR);
            if temp.exists() {
                fs::remove_dir_all(&temp)?;
            }
            fs::create_dir_all(&temp)?;
            link_dir_contents(&dirty, &temp)?;
            fs::rename(&temp, snapshot_path(dir, limit))?;
            Ok(())
        })();

        let index = Index::open(&dirty, &self.config, self.backend)?;
        index.put(keys::DIRTY_KEY, &[1], true)?;
        state.index = Some(index);

        match promoted {
            Ok(()) => {
                let previous = state.last_snapshot_pos;
                state.last_snapshot_pos = limit;
                if previous != limit {
                    let old = snapshot_path(dir, previous);
                    if old.exists() {
                        if let Err(e) = fs::remove_dir_all(&old) {
                            warn!("could not remove old snapshot {:?}: {}", old, e);
                        }
                    }
                }
                info!("index snapshot at {:016x}", limit);
                Ok(limit)
            }
            Err(e) => {
                let temp = dir.join(TEMP_INDEX_DIR);
                if temp.exists() {
                    let _ = fs::remove_dir_all(&temp);
                }
                error!(
                    "snapshot failed, keeping {:016x}: {}",
                    state.last_snapshot_pos, e
                );
                Err(e)
            }
        }
    }
}

fn load_one(
    state: &OpenState,
    index: &Index,
    snapshot: Option<&leveldb::snapshots::Snapshot<'_, IndexKey>>,
    request: &MessageLookup,
) -> Result<Option<Vec<u8>>> {
    let cached = request.locator.as_ref().and_then(|cell| *cell.lock());
    let locator = match cached {
        Some(locator) => Some(locator),
        None => index
            .get(snapshot, &keys::message_key(request.msg_key))?
            .map(|value| Locator::decode(&value))
            .transpose()?,
    };
    let locator = match locator {
        Some(locator) => locator,
        None => return Ok(None),
    };

    let payload = state.log.read_payload(locator.position, locator.length)?;
    let (msg_key, body) = decode_message_payload(&payload)?;
    if msg_key != request.msg_key {
        return Err(StoreError::Corrupt {
            position: locator.position,
            reason: format!("locator for message {} points at message {}", request.msg_key, msg_key),
        });
    }
    Ok(Some(body.to_vec()))
}

fn apply_replay(
    state: &OpenState,
    index: &Index,
    ledger: &mut LogRefLedger,
    kind: u8,
    payload: &[u8],
    pos: u64,
) -> Result<()> {
    use integer_encoding::VarInt;

    let kind = match RecordKind::from_u8(kind) {
        Some(kind) => kind,
        None => {
            debug!("skipping record of unknown kind {}", kind);
            return Ok(());
        }
    };
    match kind {
        RecordKind::AddMessage => {
            // The payload embeds its key; the locator points back at this
            // very record.
            let (msg_key, _) = decode_message_payload(payload).map_err(|_| {
                StoreError::Codec(Box::new(bincode::ErrorKind::Custom(
                    "message payload shorter than its key".to_owned(),
                )))
            })?;
            let locator = Locator {
                position: pos,
                length: payload.len() as u32,
            };
            index.put(&keys::message_key(msg_key), &locator.encode(), false)?;
        }
        RecordKind::AddQueueEntry => {
            let entry: QueueEntryRecord = bincode::deserialize(payload)?;
            index.put(
                &keys::entry_key(entry.queue_key, entry.entry_seq),
                payload,
                false,
            )?;
            if let Some(position) = resolve_entry_position(index, &entry)? {
                ledger.incr(&state.log, position);
            }
        }
        RecordKind::RemoveQueueEntry => {
            // The payload is the entry's index key.
            if let Some(stored) = index.get(None, payload)? {
                let entry: QueueEntryRecord = bincode::deserialize(&stored)?;
                if let Some(position) = resolve_entry_position(index, &entry)? {
                    ledger.decr(&state.log, position);
                }
                index.delete(payload, false)?;
            }
        }
        RecordKind::AddQueue => {
            let queue: QueueRecord = bincode::deserialize(payload)?;
            index.put(&keys::queue_key(queue.queue_key), payload, false)?;
        }
        RecordKind::RemoveQueue => {
            let (queue, _) = u64::decode_var(payload).ok_or_else(|| {
                StoreError::Codec(Box::new(bincode::ErrorKind::Custom(
                    "queue key varint malformed".to_owned(),
                )))
            })?;
            index.delete(&keys::queue_key(queue), false)?;
            let mut doomed = Vec::new();
            index.scan_prefix(None, &keys::entry_prefix(queue), |key, value| {
                doomed.push((key, value));
                Ok(true)
            })?;
            for (key, value) in doomed {
                let entry: QueueEntryRecord = bincode::deserialize(&value)?;
                if let Some(position) = resolve_entry_position(index, &entry)? {
                    ledger.decr(&state.log, position);
                }
                index.delete(&key, false)?;
            }
        }
        RecordKind::MapEntry => {
            let (user_key, value): (Vec<u8>, Option<Vec<u8>>) = bincode::deserialize(payload)?;
            match value {
                Some(value) => index.put(&keys::map_key(&user_key), &value, false)?,
                None => index.delete(&keys::map_key(&user_key), false)?,
            }
        }
        RecordKind::RemoveMessage => {
            // Reserved code point; nothing emits it yet.
        }
    }
    Ok(())
}

/// Where the message referenced by `entry` lives: the entry's embedded
/// locator when it has one, the current index locator otherwise.
pub(crate) fn resolve_entry_position(index: &Index, entry: &QueueEntryRecord) -> Result<Option<u64>> {
    if let Some(locator) = entry.locator {
        return Ok(Some(locator.position));
    }
    if entry.msg_key == 0 {
        return Ok(None);
    }
    match index.get(None, &keys::message_key(entry.msg_key))? {
        Some(value) => Ok(Some(Locator::decode(&value)?.position)),
        None => {
            warn!(
                "no locator for message {} referenced by queue {} entry {}",
                entry.msg_key, entry.queue_key, entry.entry_seq
            );
            Ok(None)
        }
    }
}

fn check_directory_writable(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir)?;
    if meta.permissions().readonly() {
        return Err(StoreError::Config(format!(
            "data directory {:?} is not writable",
            dir
        )));
    }
    Ok(())
}

/// Hard-link `src` to `dst`, falling back to the OS tool and finally to a
/// byte copy on filesystems that refuse `link(2)`.
fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    match Command::new("ln").arg(src).arg(dst).status() {
        Ok(status) if status.success() => Ok(()),
        _ => fs::copy(src, dst).map(|_| ()),
    }
}

fn link_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            link_or_copy(&path, &dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// Snapshot directories in `dir`, sorted by the position their hex name
/// encodes. `dirty.index` and `temp.index` fail the hex parse and drop out.
fn sorted_snapshot_positions(dir: &Path) -> Result<Vec<u64>> {
    let mut positions: Vec<u64> = fs::read_dir(dir)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_dir() && path.extension() == Some("index".as_ref()))
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

/// join path: {dir}/{position as %016x}.index
fn snapshot_path(dir: &Path, position: u64) -> PathBuf {
    dir.join(format!("{:016x}.index", position))
}

fn wait_callback() -> (CompletionCallback, mpsc::Receiver<Result<()>>) {
    let (sender, receiver) = mpsc::channel();
    let callback: CompletionCallback = Box::new(move |result| {
        let _ = sender.send(result);
    });
    (callback, receiver)
}

/// Results are shared across several callbacks; errors lose their structure
/// but keep their message.
pub(crate) fn share_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(StoreError::StringError(e.to_string())),
    }
}
