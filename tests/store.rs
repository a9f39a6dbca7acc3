use std::path::Path;

use mqstore::{
    MessageAction, MessageLookup, MessageRecord, MessageStore, QueueEntryRecord, QueueRecord,
    StoreConfig, UnitOfWork,
};

fn config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
}

fn message(msg_key: u64, payload: &[u8]) -> MessageRecord {
    MessageRecord {
        msg_key,
        payload: payload.to_vec(),
        locator: None,
    }
}

fn entry(queue_key: u64, entry_seq: u64, msg_key: u64, size: u32) -> QueueEntryRecord {
    QueueEntryRecord {
        queue_key,
        entry_seq,
        msg_key,
        size,
        expiration: 0,
        locator: None,
    }
}

fn enqueue_uow(queue_key: u64, entry_seq: u64, msg_key: u64, payload: &[u8]) -> UnitOfWork {
    UnitOfWork {
        map_actions: Vec::new(),
        actions: vec![MessageAction {
            message: Some(message(msg_key, payload)),
            enqueues: vec![entry(queue_key, entry_seq, msg_key, payload.len() as u32)],
            dequeues: Vec::new(),
        }],
        on_complete: None,
    }
}

fn dequeue_uow(dequeued: QueueEntryRecord) -> UnitOfWork {
    UnitOfWork {
        map_actions: Vec::new(),
        actions: vec![MessageAction {
            message: None,
            enqueues: Vec::new(),
            dequeues: vec![dequeued],
        }],
        on_complete: None,
    }
}

fn log_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.path().extension() == Some("log".as_ref()))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn snapshot_dirs(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| {
            let path = entry.path();
            path.is_dir()
                && path.extension() == Some("index".as_ref())
                && path.file_stem() != Some("dirty".as_ref())
                && path.file_stem() != Some("temp".as_ref())
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn write_then_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::start(config(dir.path())).unwrap();

    store
        .add_queue_sync(QueueRecord {
            queue_key: 1,
            metadata: b"orders".to_vec(),
        })
        .unwrap();
    store.store_sync(vec![enqueue_uow(1, 0, 42, b"hi")]).unwrap();

    let loaded = store.load_messages(&[MessageLookup::by_key(42)]).unwrap();
    assert_eq!(loaded, vec![Some(b"hi".to_vec())]);

    let queues = store.list_queues().unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].queue_key, 1);
    assert_eq!(queues[0].metadata, b"orders");

    let entries = store.get_queue_entries(1, 0, u64::MAX).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].msg_key, 42);
    assert!(entries[0].locator.is_some());

    assert_eq!(store.get_last_message_key().unwrap(), 42);
    assert_eq!(store.get_last_queue_key().unwrap(), 1);

    store.stop().unwrap();
}

#[test]
fn dequeue_releases_rotated_segment() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::start(config(dir.path()).with_log_size(1024)).unwrap();

    store
        .add_queue_sync(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();
    for seq in 0..8u64 {
        let payload = vec![seq as u8; 200];
        store
            .store_sync(vec![enqueue_uow(1, seq, 100 + seq, &payload)])
            .unwrap();
    }
    assert!(
        store.segments().unwrap().len() > 1,
        "eight 200-byte messages must rotate a 1 KiB log"
    );

    for dequeued in store.get_queue_entries(1, 0, u64::MAX).unwrap() {
        store.store_sync(vec![dequeue_uow(dequeued)]).unwrap();
    }

    store.snapshot_index().unwrap();
    let before = log_files(dir.path());
    let deleted = store.gc().unwrap();
    let after = log_files(dir.path());

    assert!(deleted >= 1, "unreferenced rotated segments must go");
    assert_eq!(after.len(), before.len() - deleted);
    // The tail always survives.
    assert_eq!(after.last(), before.last());

    store.stop().unwrap();
}

#[test]
fn unclean_shutdown_recovers_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MessageStore::start(config(dir.path())).unwrap();
        store
            .add_queue_sync(QueueRecord {
                queue_key: 3,
                metadata: b"q3".to_vec(),
            })
            .unwrap();
        for seq in 0..5u64 {
            store
                .store_sync(vec![enqueue_uow(3, seq, 500 + seq, format!("m{}", seq).as_bytes())])
                .unwrap();
        }
        // No stop(): the index never gets a snapshot and recovery has to
        // replay the whole log.
    }

    let store = MessageStore::start(config(dir.path())).unwrap();
    assert_eq!(store.list_queues().unwrap().len(), 1);
    let entries = store.get_queue_entries(3, 0, u64::MAX).unwrap();
    assert_eq!(entries.len(), 5);
    for seq in 0..5u64 {
        let loaded = store
            .load_messages(&[MessageLookup::by_key(500 + seq)])
            .unwrap();
        assert_eq!(loaded, vec![Some(format!("m{}", seq).into_bytes())]);
    }
    store.stop().unwrap();
}

#[test]
fn remove_queue_cascades_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MessageStore::start(config(dir.path())).unwrap();
        store
            .add_queue_sync(QueueRecord {
                queue_key: 7,
                metadata: Vec::new(),
            })
            .unwrap();
        for seq in 0..3u64 {
            store
                .store_sync(vec![enqueue_uow(7, seq, 700 + seq, b"payload")])
                .unwrap();
        }
        assert_eq!(store.get_queue_entries(7, 0, u64::MAX).unwrap().len(), 3);
        let held: u32 = store.segment_refs().unwrap().iter().map(|&(_, n)| n).sum();
        assert_eq!(held, 3);

        store.remove_queue_sync(7).unwrap();
        assert!(store.get_queue(7).unwrap().is_none());
        assert!(store.segment_refs().unwrap().is_empty());
    }

    let store = MessageStore::start(config(dir.path())).unwrap();
    assert!(store.list_queues().unwrap().is_empty());
    assert!(store.get_queue_entries(7, 0, u64::MAX).unwrap().is_empty());
    assert!(store.segment_refs().unwrap().is_empty());
    store.stop().unwrap();
}

#[test]
fn snapshot_during_concurrent_writes_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::start(config(dir.path())).unwrap();
    store
        .add_queue_sync(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();

    const WRITES: u64 = 50;
    crossbeam_utils::thread::scope(|scope| {
        let writer = scope.spawn(|_| {
            for seq in 0..WRITES {
                store
                    .store_sync(vec![enqueue_uow(1, seq, 1000 + seq, b"concurrent")])
                    .unwrap();
            }
        });

        for _ in 0..3 {
            store.snapshot_index().unwrap();
        }
        writer.join().unwrap();
    })
    .unwrap();

    store.snapshot_index().unwrap();
    assert_eq!(snapshot_dirs(dir.path()).len(), 1);

    let lookups: Vec<MessageLookup> =
        (0..WRITES).map(|seq| MessageLookup::by_key(1000 + seq)).collect();
    let loaded = store.load_messages(&lookups).unwrap();
    assert!(loaded.iter().all(|payload| payload.is_some()));
    assert_eq!(store.get_queue_entries(1, 0, u64::MAX).unwrap().len(), WRITES as usize);

    store.stop().unwrap();
}

#[test]
fn map_upserts_and_deletes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MessageStore::start(config(dir.path())).unwrap();
        store
            .store_sync(vec![UnitOfWork {
                map_actions: vec![
                    (b"a".to_vec(), Some(b"1".to_vec())),
                    (b"b".to_vec(), Some(b"2".to_vec())),
                ],
                actions: Vec::new(),
                on_complete: None,
            }])
            .unwrap();
        store
            .store_sync(vec![UnitOfWork {
                map_actions: vec![(b"a".to_vec(), None)],
                actions: Vec::new(),
                on_complete: None,
            }])
            .unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    let store = MessageStore::start(config(dir.path())).unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    store.stop().unwrap();
}

#[test]
fn entries_come_back_in_numeric_seq_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::start(config(dir.path())).unwrap();
    store
        .add_queue_sync(QueueRecord {
            queue_key: 9,
            metadata: Vec::new(),
        })
        .unwrap();

    // Sequences chosen to straddle byte-width boundaries.
    let seqs = [300u64, 1, 256, 2, 255, 70000];
    for &seq in &seqs {
        store
            .store_sync(vec![enqueue_uow(9, seq, 9000 + seq, b"ordered")])
            .unwrap();
    }

    let read: Vec<u64> = store
        .get_queue_entries(9, 0, u64::MAX)
        .unwrap()
        .iter()
        .map(|e| e.entry_seq)
        .collect();
    assert_eq!(read, vec![1, 2, 255, 256, 300, 70000]);

    let groups = store.list_queue_entry_groups(9, 4).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].first_entry_seq, 1);
    assert_eq!(groups[0].last_entry_seq, 256);
    assert_eq!(groups[0].count, 4);
    assert_eq!(groups[1].first_entry_seq, 300);
    assert_eq!(groups[1].last_entry_seq, 70000);
    assert_eq!(groups[1].count, 2);
    assert_eq!(groups[0].size, 4 * 7);

    store.stop().unwrap();
}

#[test]
fn restart_after_clean_stop_skips_replay_state_loss() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MessageStore::start(config(dir.path())).unwrap();
        store
            .add_queue_sync(QueueRecord {
                queue_key: 2,
                metadata: Vec::new(),
            })
            .unwrap();
        store.store_sync(vec![enqueue_uow(2, 0, 20, b"kept")]).unwrap();
        store.stop().unwrap();
        assert_eq!(snapshot_dirs(dir.path()).len(), 1);
    }

    let store = MessageStore::start(config(dir.path())).unwrap();
    assert_eq!(
        store.load_messages(&[MessageLookup::by_key(20)]).unwrap(),
        vec![Some(b"kept".to_vec())]
    );
    store.stop().unwrap();
}
