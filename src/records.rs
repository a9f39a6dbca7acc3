//! Record types shared by the log, the index and the client API.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Type codes carried in the log frame header.
///
/// `RemoveMessage` is reserved in the format but never emitted by the
/// current writer; replay decodes and skips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordKind {
    AddQueue = 1,
    RemoveQueue = 2,
    AddMessage = 3,
    RemoveMessage = 4,
    AddQueueEntry = 5,
    RemoveQueueEntry = 6,
    MapEntry = 7,
}

impl RecordKind {
    pub(crate) fn from_u8(code: u8) -> Option<RecordKind> {
        match code {
            1 => Some(RecordKind::AddQueue),
            2 => Some(RecordKind::RemoveQueue),
            3 => Some(RecordKind::AddMessage),
            4 => Some(RecordKind::RemoveMessage),
            5 => Some(RecordKind::AddQueueEntry),
            6 => Some(RecordKind::RemoveQueueEntry),
            7 => Some(RecordKind::MapEntry),
            _ => None,
        }
    }
}

/// Where a message payload sits in the log: the logical position of its
/// `AddMessage` record and the record's payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    /// Logical log position of the record.
    pub position: u64,
    /// Payload length in bytes.
    pub length: u32,
}

impl Locator {
    /// Fixed 12-byte big-endian encoding used as the `m` key value.
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.position.to_be_bytes());
        buf[8..].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode the 12-byte form.
    pub fn decode(buf: &[u8]) -> Result<Locator> {
        if buf.len() != 12 {
            return Err(StoreError::StringError(format!(
                "locator must be 12 bytes, got {}",
                buf.len()
            )));
        }
        let position = u64::from_be_bytes(buf[..8].try_into().expect("sized above"));
        let length = u32::from_be_bytes(buf[8..].try_into().expect("sized above"));
        Ok(Locator { position, length })
    }
}

/// Shared cell holding the latest locator of an in-flight message.
///
/// The producer keeps a handle to this cell; the commit path writes the
/// locator once the `AddMessage` record has a position, and later enqueues
/// in the same unit of work read it back without an index lookup.
pub type LocatorCell = Arc<Mutex<Option<Locator>>>;

/// Create an empty [`LocatorCell`].
pub fn locator_cell() -> LocatorCell {
    Arc::new(Mutex::new(None))
}

/// A message presented by a write unit of work. Immutable once committed;
/// destroyed when no queue entry references it any more.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// Broker-assigned message key, unique across the store.
    pub msg_key: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Optional shared cell the commit path publishes the locator into.
    pub locator: Option<LocatorCell>,
}

/// A queue known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Broker-assigned queue key.
    pub queue_key: u64,
    /// Opaque queue metadata (binding, name, etc.).
    pub metadata: Vec<u8>,
}

/// An entry placing a message on a queue. Destroyed on dequeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntryRecord {
    /// Queue this entry belongs to.
    pub queue_key: u64,
    /// Position of the entry within the queue.
    pub entry_seq: u64,
    /// Key of the referenced message, `0` if none.
    pub msg_key: u64,
    /// Message size in bytes, carried for browsing stats.
    pub size: u32,
    /// Expiration timestamp, `0` when the entry does not expire.
    pub expiration: i64,
    /// Locator of the referenced message, stamped at commit time.
    pub locator: Option<Locator>,
}

/// Aggregated view over a run of queue entries, produced by
/// [`MessageStore::list_queue_entry_groups`](crate::MessageStore::list_queue_entry_groups).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntryRange {
    /// First entry sequence in the group.
    pub first_entry_seq: u64,
    /// Last entry sequence in the group.
    pub last_entry_seq: u64,
    /// Number of entries in the group.
    pub count: u32,
    /// Total message bytes in the group.
    pub size: u64,
    /// Smallest non-zero expiration in the group, `0` if none expire.
    pub expiration: i64,
}

/// Callback invoked once a queued mutation has been committed (or failed).
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// An upsert (`Some`) or delete (`None`) against the auxiliary user map.
pub type MapAction = (Vec<u8>, Option<Vec<u8>>);

/// Per-message slice of a unit of work: an optional message write plus the
/// queue placements and removals that go with it.
#[derive(Debug, Default)]
pub struct MessageAction {
    /// Message to append, if this action carries one.
    pub message: Option<MessageRecord>,
    /// Entries to add.
    pub enqueues: Vec<QueueEntryRecord>,
    /// Entries to remove.
    pub dequeues: Vec<QueueEntryRecord>,
}

/// An atomic batch of map, message, enqueue and dequeue actions.
///
/// A unit of work with a completion callback asks for durability: the
/// commit path fsyncs the log before invoking it (when the store is
/// configured with `sync = true`).
#[derive(Default)]
pub struct UnitOfWork {
    /// Ordered mutations against the user map.
    pub map_actions: Vec<MapAction>,
    /// Per-message actions, applied in order.
    pub actions: Vec<MessageAction>,
    /// Invoked after commit with the outcome.
    pub on_complete: Option<CompletionCallback>,
}

impl UnitOfWork {
    /// A unit of work with no actions yet.
    pub fn new() -> UnitOfWork {
        UnitOfWork::default()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("map_actions", &self.map_actions.len())
            .field("actions", &self.actions.len())
            .field("has_listener", &self.on_complete.is_some())
            .finish()
    }
}

/// `AddMessage` payload layout: 8-byte big-endian message key followed by
/// the raw payload bytes. The locator length covers both.
pub(crate) fn encode_message_payload(msg_key: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&msg_key.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn decode_message_payload(buf: &[u8]) -> Result<(u64, &[u8])> {
    if buf.len() < 8 {
        return Err(StoreError::StringError(
            "message payload shorter than its key".to_owned(),
        ));
    }
    let msg_key = u64::from_be_bytes(buf[..8].try_into().expect("sized above"));
    Ok((msg_key, &buf[8..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_encoding_round_trips() {
        let loc = Locator {
            position: 0x0102030405060708,
            length: 0x0a0b0c0d,
        };
        assert_eq!(Locator::decode(&loc.encode()).unwrap(), loc);
        assert!(Locator::decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn message_payload_carries_its_key() {
        let buf = encode_message_payload(42, b"hi");
        let (key, payload) = decode_message_payload(&buf).unwrap();
        assert_eq!(key, 42);
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn reserved_record_kind_still_decodes() {
        assert_eq!(RecordKind::from_u8(4), Some(RecordKind::RemoveMessage));
        assert_eq!(RecordKind::from_u8(99), None);
    }
}
