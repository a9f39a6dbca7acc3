//! The ordered commit path. For each unit of work: map actions first, then
//! per-action message append, dequeues and enqueues; one atomic index batch
//! after all appends; fsync only when a unit carried a completion listener
//! and the store is configured for it.
//!
//! On failure the partial appends are cut back so a retry starts from a
//! clean log prefix; ledger deltas are buffered and applied only once the
//! index batch has committed.

use integer_encoding::VarInt;
use leveldb::batch::Writebatch;
use log::error;

use crate::config::StoreConfig;
use crate::index::{Index, IndexKey};
use crate::keys;
use crate::records::{
    encode_message_payload, Locator, QueueEntryRecord, QueueRecord, RecordKind, UnitOfWork,
};
use crate::{Result, StoreError};

use super::{resolve_entry_position, OpenState};

pub(crate) fn commit_uows(
    config: &StoreConfig,
    state: &OpenState,
    uows: &mut [UnitOfWork],
) -> Result<()> {
    let index = state.index()?;
    let mut appender = state.log.appender();
    let batch_start = state.log.appender_limit();
    let mut batch: Writebatch<IndexKey> = Writebatch::new();
    let mut ledger_deltas: Vec<(u64, i32)> = Vec::new();
    let mut sync_needed = false;

    let outcome = (|| -> Result<()> {
        for uow in uows.iter_mut() {
            for (user_key, value) in &uow.map_actions {
                let payload = bincode::serialize(&(user_key, value))?;
                appender.append(RecordKind::MapEntry, &payload)?;
                match value {
                    Some(value) => batch.put(IndexKey(keys::map_key(user_key)), value),
                    None => batch.delete(IndexKey(keys::map_key(user_key))),
                }
            }

            for action in uow.actions.iter_mut() {
                let mut message_locator = None;
                if let Some(message) = &action.message {
                    let payload = encode_message_payload(message.msg_key, &message.payload);
                    let position = appender.append(RecordKind::AddMessage, &payload)?;
                    let locator = Locator {
                        position,
                        length: payload.len() as u32,
                    };
                    batch.put(IndexKey(keys::message_key(message.msg_key)), &locator.encode());
                    if let Some(cell) = &message.locator {
                        *cell.lock() = Some(locator);
                    }
                    message_locator = Some(locator);
                }

                for dequeue in &action.dequeues {
                    let entry_key = keys::entry_key(dequeue.queue_key, dequeue.entry_seq);
                    appender.append(RecordKind::RemoveQueueEntry, &entry_key)?;
                    batch.delete(IndexKey(entry_key));
                    if dequeue.msg_key != 0 {
                        let position = dequeue
                            .locator
                            .or(message_locator)
                            .map(|locator| Ok(Some(locator.position)))
                            .unwrap_or_else(|| resolve_entry_position(index, dequeue))?;
                        if let Some(position) = position {
                            ledger_deltas.push((position, -1));
                        }
                    }
                }

                for enqueue in action.enqueues.iter_mut() {
                    // Stamp the entry with the message's locator so replay
                    // and dequeues can resolve it without an index lookup.
                    if enqueue.locator.is_none() {
                        enqueue.locator = message_locator;
                    }
                    if enqueue.locator.is_none() && enqueue.msg_key != 0 {
                        enqueue.locator = lookup_locator(index, enqueue.msg_key)?;
                    }
                    if enqueue.msg_key != 0 && enqueue.locator.is_none() {
                        return Err(StoreError::StringError(format!(
                            "no locator for message {} enqueued on queue {}",
                            enqueue.msg_key, enqueue.queue_key
                        )));
                    }
                    let payload = bincode::serialize(&*enqueue)?;
                    appender.append(RecordKind::AddQueueEntry, &payload)?;
                    batch.put(
                        IndexKey(keys::entry_key(enqueue.queue_key, enqueue.entry_seq)),
                        &payload,
                    );
                    if let Some(locator) = enqueue.locator {
                        if enqueue.msg_key != 0 {
                            ledger_deltas.push((locator.position, 1));
                        }
                    }
                }
            }

            if uow.on_complete.is_some() {
                sync_needed = true;
            }
        }

        index.write_batch(&batch, false)?;
        if sync_needed && config.sync {
            appender.sync()?;
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            state.ledger.lock().apply(&state.log, &ledger_deltas);
            Ok(())
        }
        Err(e) => {
            drop(appender);
            if let Err(rollback) = state.log.truncate(batch_start) {
                error!("could not cut partial batch from the log: {}", rollback);
            }
            Err(e)
        }
    }
}

pub(crate) fn commit_add_queue(state: &OpenState, record: &QueueRecord) -> Result<()> {
    let index = state.index()?;
    let payload = bincode::serialize(record)?;
    let mut appender = state.log.appender();
    appender.append(RecordKind::AddQueue, &payload)?;
    drop(appender);
    index.put(&keys::queue_key(record.queue_key), &payload, false)
}

pub(crate) fn commit_remove_queue(state: &OpenState, queue_key: u64) -> Result<()> {
    let index = state.index()?;
    let mut appender = state.log.appender();
    appender.append(RecordKind::RemoveQueue, &queue_key.encode_var_vec())?;
    drop(appender);

    let mut batch: Writebatch<IndexKey> = Writebatch::new();
    batch.delete(IndexKey(keys::queue_key(queue_key)));

    // Cascade: every entry still on the queue gives back its reference.
    let mut ledger_deltas = Vec::new();
    index.scan_prefix(None, &keys::entry_prefix(queue_key), |key, value| {
        let entry: QueueEntryRecord = bincode::deserialize(&value)?;
        if entry.msg_key != 0 {
            if let Some(position) = resolve_entry_position(index, &entry)? {
                ledger_deltas.push((position, -1));
            }
        }
        batch.delete(IndexKey(key));
        Ok(true)
    })?;

    index.write_batch(&batch, false)?;
    state.ledger.lock().apply(&state.log, &ledger_deltas);
    Ok(())
}

fn lookup_locator(index: &Index, msg_key: u64) -> Result<Option<Locator>> {
    index
        .get(None, &keys::message_key(msg_key))?
        .map(|value| Locator::decode(&value))
        .transpose()
}
