//! Index key layout.
//!
//! Every key is a one-byte prefix followed by big-endian fixed-width
//! integers, so that lexicographic order equals numeric order. Prefix and
//! range cursors depend on this.

/// Prefix for message locators: `m ∥ u64(msg_key)`.
pub(crate) const MESSAGE_PREFIX: u8 = b'm';
/// Prefix for queue records: `q ∥ u64(queue_key)`.
pub(crate) const QUEUE_PREFIX: u8 = b'q';
/// Prefix for queue entries: `e ∥ u64(queue_key) ∥ u64(entry_seq)`.
pub(crate) const ENTRY_PREFIX: u8 = b'e';
/// Prefix for the auxiliary user map: `p ∥ bytes(user_key)`.
pub(crate) const MAP_PREFIX: u8 = b'p';

/// Sentinel marking the index as mid-mutation. Lives outside the prefix
/// space.
pub(crate) const DIRTY_KEY: &[u8] = b":dirty";
/// Sentinel holding the serialized log-reference ledger.
pub(crate) const LOG_REFS_KEY: &[u8] = b":log-refs";

pub(crate) fn message_key(msg_key: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(MESSAGE_PREFIX);
    key.extend_from_slice(&msg_key.to_be_bytes());
    key
}

pub(crate) fn queue_key(queue_key: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(QUEUE_PREFIX);
    key.extend_from_slice(&queue_key.to_be_bytes());
    key
}

pub(crate) fn entry_key(queue_key: u64, entry_seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(ENTRY_PREFIX);
    key.extend_from_slice(&queue_key.to_be_bytes());
    key.extend_from_slice(&entry_seq.to_be_bytes());
    key
}

/// Prefix covering every entry of one queue.
pub(crate) fn entry_prefix(queue_key: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(ENTRY_PREFIX);
    key.extend_from_slice(&queue_key.to_be_bytes());
    key
}

pub(crate) fn map_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + user_key.len());
    key.push(MAP_PREFIX);
    key.extend_from_slice(user_key);
    key
}

/// Decode the `u64` following a one-byte prefix (`m` and `q` keys).
pub(crate) fn decode_u64_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(1..9)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Decode an `e` key into `(queue_key, entry_seq)`.
pub(crate) fn decode_entry_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 17 || key[0] != ENTRY_PREFIX {
        return None;
    }
    let queue: [u8; 8] = key[1..9].try_into().ok()?;
    let seq: [u8; 8] = key[9..17].try_into().ok()?;
    Some((u64::from_be_bytes(queue), u64::from_be_bytes(seq)))
}

/// Strip the `p` prefix off a map key.
pub(crate) fn decode_map_key(key: &[u8]) -> Option<&[u8]> {
    match key.split_first() {
        Some((&MAP_PREFIX, user_key)) => Some(user_key),
        _ => None,
    }
}
