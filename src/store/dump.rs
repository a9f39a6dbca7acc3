//! Bulk export and import: a length-framed, section-tagged dump of the
//! whole store, taken under one index snapshot. Sections are written in
//! dependency order (maps, queues, messages, queue entries) so an import
//! can re-stamp entry locators as it streams.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};

use integer_encoding::VarInt;
use log::warn;

use crate::keys;
use crate::records::{
    decode_message_payload, Locator, QueueEntryRecord, QueueRecord, RecordKind,
};
use crate::{Result, StoreError};

use super::{MessageStore, StoreInner};

const MAGIC: &[u8; 8] = b"MQSTDUMP";
const VERSION: u8 = 1;

const TAG_END: u8 = 0;
const TAG_MAP: u8 = 1;
const TAG_QUEUE: u8 = 2;
const TAG_MESSAGE: u8 = 3;
const TAG_ENTRY: u8 = 4;

/// A frame larger than this is taken as stream corruption, not data.
const MAX_FRAME: u64 = 1 << 30;

/// What a dump stream carried.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DumpStats {
    /// User map entries.
    pub map_entries: u64,
    /// Queue records.
    pub queues: u64,
    /// Messages with payloads.
    pub messages: u64,
    /// Queue entries.
    pub queue_entries: u64,
}

impl fmt::Display for DumpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} map entr(ies), {} queue(s), {} message(s), {} queue entr(ies)",
            self.map_entries, self.queues, self.messages, self.queue_entries
        )
    }
}

pub(crate) fn export(inner: &StoreInner, out: &mut dyn Write) -> Result<DumpStats> {
    inner.with_state(|state| {
        let index = state.index()?;
        let snapshot = index.snapshot();
        let mut stats = DumpStats::default();

        out.write_all(MAGIC)?;
        out.write_all(&[VERSION])?;

        index.scan_prefix(Some(&snapshot), &[keys::MAP_PREFIX], |key, value| {
            let user_key = match keys::decode_map_key(&key) {
                Some(user_key) => user_key.to_vec(),
                None => return Ok(true),
            };
            write_frame(out, TAG_MAP, &bincode::serialize(&(user_key, value))?)?;
            stats.map_entries += 1;
            Ok(true)
        })?;

        // Queue and entry values are stored pre-encoded; pass them through.
        index.scan_prefix(Some(&snapshot), &[keys::QUEUE_PREFIX], |_, value| {
            write_frame(out, TAG_QUEUE, &value)?;
            stats.queues += 1;
            Ok(true)
        })?;

        index.scan_prefix(Some(&snapshot), &[keys::MESSAGE_PREFIX], |_, value| {
            let locator = Locator::decode(&value)?;
            let payload = state.log.read_payload(locator.position, locator.length)?;
            write_frame(out, TAG_MESSAGE, &payload)?;
            stats.messages += 1;
            Ok(true)
        })?;

        index.scan_prefix(Some(&snapshot), &[keys::ENTRY_PREFIX], |_, value| {
            write_frame(out, TAG_ENTRY, &value)?;
            stats.queue_entries += 1;
            Ok(true)
        })?;

        write_frame(out, TAG_END, &[])?;
        out.flush()?;
        Ok(stats)
    })
}

pub(crate) fn import(
    store: &MessageStore,
    inner: &StoreInner,
    input: &mut dyn Read,
) -> Result<DumpStats> {
    // Validate the header before destroying anything.
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(StoreError::StringError(
            "input is not a message store dump".to_owned(),
        ));
    }
    let mut version = [0u8; 1];
    input.read_exact(&mut version)?;
    if version[0] != VERSION {
        return Err(StoreError::StringError(format!(
            "unsupported dump version {}",
            version[0]
        )));
    }

    store.purge()?;

    let stats = inner.with_state(|state| {
        let index = state.index()?;
        let mut appender = state.log.appender();
        let mut ledger = state.ledger.lock();
        let mut locators: HashMap<u64, Locator> = HashMap::new();
        let mut stats = DumpStats::default();

        loop {
            let (tag, bytes) = read_frame(input)?;
            match tag {
                TAG_END => break,
                TAG_MAP => {
                    let (user_key, value): (Vec<u8>, Vec<u8>) = bincode::deserialize(&bytes)?;
                    index.put(&keys::map_key(&user_key), &value, false)?;
                    stats.map_entries += 1;
                }
                TAG_QUEUE => {
                    let queue: QueueRecord = bincode::deserialize(&bytes)?;
                    index.put(&keys::queue_key(queue.queue_key), &bytes, false)?;
                    stats.queues += 1;
                }
                TAG_MESSAGE => {
                    // Re-append, and index the locator the message lands at
                    // in this store, not the one it had in the source.
                    let (msg_key, _) = decode_message_payload(&bytes)?;
                    let position = appender.append(RecordKind::AddMessage, &bytes)?;
                    let locator = Locator {
                        position,
                        length: bytes.len() as u32,
                    };
                    index.put(&keys::message_key(msg_key), &locator.encode(), false)?;
                    locators.insert(msg_key, locator);
                    stats.messages += 1;
                }
                TAG_ENTRY => {
                    let mut entry: QueueEntryRecord = bincode::deserialize(&bytes)?;
                    entry.locator = locators.get(&entry.msg_key).copied();
                    if entry.msg_key != 0 && entry.locator.is_none() {
                        warn!(
                            "dump entry on queue {} references unknown message {}",
                            entry.queue_key, entry.msg_key
                        );
                    }
                    index.put(
                        &keys::entry_key(entry.queue_key, entry.entry_seq),
                        &bincode::serialize(&entry)?,
                        false,
                    )?;
                    if let Some(locator) = entry.locator {
                        ledger.incr(&state.log, locator.position);
                    }
                    stats.queue_entries += 1;
                }
                other => {
                    return Err(StoreError::StringError(format!(
                        "unknown dump section tag {}",
                        other
                    )))
                }
            }
        }

        appender.sync()?;
        Ok(stats)
    })?;

    store.snapshot_index()?;
    Ok(stats)
}

fn write_frame(out: &mut dyn Write, tag: u8, bytes: &[u8]) -> Result<()> {
    out.write_all(&[tag])?;
    out.write_all(&(bytes.len() as u64).encode_var_vec())?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_frame(input: &mut dyn Read) -> Result<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;

    let mut len_buf = [0u8; 10];
    let mut n = 0;
    loop {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        len_buf[n] = byte[0];
        n += 1;
        if byte[0] & 0x80 == 0 {
            break;
        }
        if n == len_buf.len() {
            return Err(StoreError::StringError(
                "dump frame length varint too long".to_owned(),
            ));
        }
    }
    let (len, _) = u64::decode_var(&len_buf[..n]).ok_or_else(|| {
        StoreError::StringError("dump frame length varint malformed".to_owned())
    })?;
    if len > MAX_FRAME {
        return Err(StoreError::StringError(format!(
            "dump frame of {} bytes exceeds the sanity limit",
            len
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes)?;
    Ok((tag[0], bytes))
}
