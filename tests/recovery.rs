use std::fs::OpenOptions;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use mqstore::{
    MessageAction, MessageLookup, MessageRecord, MessageStore, QueueEntryRecord, QueueRecord,
    StoreConfig, UnitOfWork,
};

fn config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
}

fn enqueue_uow(queue_key: u64, entry_seq: u64, msg_key: u64, payload: &[u8]) -> UnitOfWork {
    UnitOfWork {
        map_actions: Vec::new(),
        actions: vec![MessageAction {
            message: Some(MessageRecord {
                msg_key,
                payload: payload.to_vec(),
                locator: None,
            }),
            enqueues: vec![QueueEntryRecord {
                queue_key,
                entry_seq,
                msg_key,
                size: payload.len() as u32,
                expiration: 0,
                locator: None,
            }],
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

fn tail_log_file(dir: &Path) -> PathBuf {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension() == Some("log".as_ref()))
        .collect();
    logs.sort();
    logs.pop().expect("store directory holds no log segment")
}

/// Crash at an arbitrary byte offset: whatever intact record prefix
/// survives is exactly what recovery rebuilds, and the store keeps
/// accepting writes afterwards.
#[test]
fn recovery_rebuilds_the_longest_intact_prefix() {
    const MESSAGES: u64 = 6;
    for cut in [1u64, 7, 40, 120] {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MessageStore::start(config(dir.path())).unwrap();
            store
                .add_queue_sync(QueueRecord {
                    queue_key: 1,
                    metadata: Vec::new(),
                })
                .unwrap();
            for seq in 0..MESSAGES {
                store
                    .store_sync(vec![enqueue_uow(1, seq, 100 + seq, &vec![seq as u8; 32])])
                    .unwrap();
            }
        }

        // Chop the tail mid-record.
        let tail = tail_log_file(dir.path());
        let len = std::fs::metadata(&tail).unwrap().len();
        assert!(len > cut, "cut {} must land inside the file", cut);
        OpenOptions::new()
            .write(true)
            .open(&tail)
            .unwrap()
            .set_len(len - cut)
            .unwrap();

        let store = MessageStore::start(config(dir.path())).unwrap();

        let present: Vec<bool> = (0..MESSAGES)
            .map(|seq| {
                store
                    .load_messages(&[MessageLookup::by_key(100 + seq)])
                    .unwrap()[0]
                    .is_some()
            })
            .collect();
        let survivors = present.iter().filter(|&&p| p).count();
        assert_eq!(
            &present[..survivors],
            vec![true; survivors].as_slice(),
            "cut {}: surviving messages must form a prefix: {:?}",
            cut,
            present
        );
        assert!(
            present[survivors..].iter().all(|&p| !p),
            "cut {}: nothing after the first casualty may survive: {:?}",
            cut,
            present
        );

        // An entry can only survive with its message: it is appended after.
        for entry in store.get_queue_entries(1, 0, u64::MAX).unwrap() {
            assert!(present[(entry.msg_key - 100) as usize]);
        }

        // The truncated tail is writable again.
        store
            .store_sync(vec![enqueue_uow(1, 1000, 999, b"after the crash")])
            .unwrap();
        assert_eq!(
            store.load_messages(&[MessageLookup::by_key(999)]).unwrap(),
            vec![Some(b"after the crash".to_vec())]
        );
        store.stop().unwrap();
    }
}

#[test]
fn recovery_recounts_ledger_references() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MessageStore::start(config(dir.path()).with_log_size(512)).unwrap();
        store
            .add_queue_sync(QueueRecord {
                queue_key: 1,
                metadata: Vec::new(),
            })
            .unwrap();
        for seq in 0..6u64 {
            store
                .store_sync(vec![enqueue_uow(1, seq, 100 + seq, &vec![0u8; 100])])
                .unwrap();
        }
        let mut entries = store.get_queue_entries(1, 0, u64::MAX).unwrap();
        assert_eq!(entries.len(), 6);
        for dequeued in entries.drain(..2) {
            store.store_sync(vec![dequeue_uow(dequeued)]).unwrap();
        }
        let held: u32 = store.segment_refs().unwrap().iter().map(|&(_, n)| n).sum();
        assert_eq!(held, 4);
        // Crash without snapshot.
    }

    let store = MessageStore::start(config(dir.path())).unwrap();
    let refs = store.segment_refs().unwrap();
    let held: u32 = refs.iter().map(|&(_, n)| n).sum();
    assert_eq!(held, 4, "replay must recount to the same totals: {:?}", refs);
    assert!(refs.len() > 1, "100-byte messages in 512-byte segments span files");
    store.stop().unwrap();
}

#[test]
fn gc_never_outruns_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::start(config(dir.path()).with_log_size(512)).unwrap();
    store
        .add_queue_sync(QueueRecord {
            queue_key: 1,
            metadata: Vec::new(),
        })
        .unwrap();
    for seq in 0..6u64 {
        store
            .store_sync(vec![enqueue_uow(1, seq, 100 + seq, &vec![0u8; 100])])
            .unwrap();
    }
    for dequeued in store.get_queue_entries(1, 0, u64::MAX).unwrap() {
        store.store_sync(vec![dequeue_uow(dequeued)]).unwrap();
    }
    assert!(store.segments().unwrap().len() > 1);

    // Everything is unreferenced, but none of it is snapshotted yet.
    assert_eq!(store.gc().unwrap(), 0);

    store.snapshot_index().unwrap();
    assert!(store.gc().unwrap() >= 1);
    store.stop().unwrap();
}

#[test]
fn startup_elects_newest_snapshot_and_sweeps_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = MessageStore::start(config(dir.path())).unwrap();
        store
            .add_queue_sync(QueueRecord {
                queue_key: 1,
                metadata: Vec::new(),
            })
            .unwrap();
        store.store_sync(vec![enqueue_uow(1, 0, 10, b"kept")]).unwrap();
        store.stop().unwrap();
    }

    // Plant a stale low-position snapshot and a leftover temp directory.
    let stale = dir.path().join(format!("{:016x}.index", 1));
    std::fs::create_dir(&stale).unwrap();
    std::fs::write(stale.join("junk"), b"junk").unwrap();
    std::fs::create_dir(dir.path().join("temp.index")).unwrap();

    let store = MessageStore::start(config(dir.path())).unwrap();
    assert!(!stale.exists(), "older snapshots are swept at startup");
    assert!(!dir.path().join("temp.index").exists());

    let index_dirs: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| {
            entry.path().is_dir() && entry.path().extension() == Some("index".as_ref())
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "dirty.index")
        .collect();
    assert_eq!(index_dirs.len(), 1, "exactly one promoted snapshot: {:?}", index_dirs);

    assert_eq!(
        store.load_messages(&[MessageLookup::by_key(10)]).unwrap(),
        vec![Some(b"kept".to_vec())]
    );
    store.stop().unwrap();
}

#[test]
fn export_import_round_trips_everything_but_locators() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::start(config(dir.path())).unwrap();

    for queue_key in [1u64, 2] {
        store
            .add_queue_sync(QueueRecord {
                queue_key,
                metadata: format!("queue-{}", queue_key).into_bytes(),
            })
            .unwrap();
    }
    for seq in 0..3u64 {
        store
            .store_sync(vec![enqueue_uow(1, seq, 100 + seq, format!("payload-{}", seq).as_bytes())])
            .unwrap();
    }
    store
        .store_sync(vec![UnitOfWork {
            map_actions: vec![
                (b"color".to_vec(), Some(b"blue".to_vec())),
                (b"shape".to_vec(), Some(b"round".to_vec())),
            ],
            actions: Vec::new(),
            on_complete: None,
        }])
        .unwrap();

    let queues_before = store.list_queues().unwrap();
    let entries_before = store.get_queue_entries(1, 0, u64::MAX).unwrap();

    let mut dump = Vec::new();
    let exported = store.export(&mut dump).unwrap();
    assert_eq!(exported.queues, 2);
    assert_eq!(exported.messages, 3);
    assert_eq!(exported.queue_entries, 3);
    assert_eq!(exported.map_entries, 2);

    let imported = store.import(&mut Cursor::new(&dump)).unwrap();
    assert_eq!(imported, exported);

    assert_eq!(store.list_queues().unwrap(), queues_before);
    assert_eq!(store.get(b"color").unwrap(), Some(b"blue".to_vec()));
    assert_eq!(store.get(b"shape").unwrap(), Some(b"round".to_vec()));

    let entries_after = store.get_queue_entries(1, 0, u64::MAX).unwrap();
    assert_eq!(entries_after.len(), entries_before.len());
    for (before, after) in entries_before.iter().zip(&entries_after) {
        assert_eq!(before.queue_key, after.queue_key);
        assert_eq!(before.entry_seq, after.entry_seq);
        assert_eq!(before.msg_key, after.msg_key);
        assert_eq!(before.size, after.size);
        assert_eq!(before.expiration, after.expiration);
        // Locators legitimately differ: messages were re-appended.
        assert!(after.locator.is_some());
    }

    for seq in 0..3u64 {
        assert_eq!(
            store.load_messages(&[MessageLookup::by_key(100 + seq)]).unwrap(),
            vec![Some(format!("payload-{}", seq).into_bytes())]
        );
    }
    let held: u32 = store.segment_refs().unwrap().iter().map(|&(_, n)| n).sum();
    assert_eq!(held, 3);

    store.stop().unwrap();
}
