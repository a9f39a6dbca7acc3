//! The log-reference ledger: how many live queue entries still point into
//! each log segment. A segment whose counter is gone (zero) and whose
//! content is covered by a snapshot can be deleted.

use std::collections::{BTreeMap, HashMap};

use log::warn;

use crate::index::Index;
use crate::keys::LOG_REFS_KEY;
use crate::log::RecordLog;
use crate::Result;

/// In-memory `segment position -> live-reference count`, non-zero entries
/// only. Mutated only from the serial writer context; persisted into the
/// index under the `:log-refs` sentinel before each index close.
#[derive(Debug, Default)]
pub(crate) struct LogRefLedger {
    refs: HashMap<u64, u32>,
}

impl LogRefLedger {
    /// Load the ledger from the index, tolerating a missing or unreadable
    /// value: recovery rebuilds whatever the replay touches.
    pub(crate) fn load(index: &Index) -> Result<LogRefLedger> {
        let mut refs = HashMap::new();
        if let Some(raw) = index.get(None, LOG_REFS_KEY)? {
            match serde_json::from_slice::<HashMap<String, u32>>(&raw) {
                Ok(stored) => {
                    // The key domain is u64; the encoding stringifies it.
                    for (key, count) in stored {
                        match key.parse::<u64>() {
                            Ok(position) if count > 0 => {
                                refs.insert(position, count);
                            }
                            Ok(_) => {}
                            Err(_) => warn!("dropping unparseable ledger key {:?}", key),
                        }
                    }
                }
                Err(e) => warn!("stored ledger is unreadable, starting empty: {}", e),
            }
        }
        Ok(LogRefLedger { refs })
    }

    /// Serialize under `:log-refs`.
    pub(crate) fn save(&self, index: &Index, sync: bool) -> Result<()> {
        let stored: BTreeMap<String, u32> = self
            .refs
            .iter()
            .map(|(&position, &count)| (position.to_string(), count))
            .collect();
        index.put(LOG_REFS_KEY, &serde_json::to_vec(&stored)?, sync)
    }

    /// Count a new live reference to the segment holding `log_pos`.
    pub(crate) fn incr(&mut self, log: &RecordLog, log_pos: u64) {
        match log.log_info(log_pos) {
            Some(info) => *self.refs.entry(info.position).or_insert(0) += 1,
            None => warn!("reference into unknown log position {}", log_pos),
        }
    }

    /// Drop a live reference to the segment holding `log_pos`; the entry
    /// disappears when its counter reaches zero.
    pub(crate) fn decr(&mut self, log: &RecordLog, log_pos: u64) {
        let position = match log.log_info(log_pos) {
            Some(info) => info.position,
            None => {
                warn!("dereference of unknown log position {}", log_pos);
                return;
            }
        };
        let emptied = match self.refs.get_mut(&position) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => {
                warn!("dereference of unreferenced segment {:016x}", position);
                false
            }
        };
        if emptied {
            self.refs.remove(&position);
        }
    }

    /// Apply deferred `(log_pos, delta)` pairs from a committed batch.
    pub(crate) fn apply(&mut self, log: &RecordLog, deltas: &[(u64, i32)]) {
        for &(log_pos, delta) in deltas {
            match delta.cmp(&0) {
                std::cmp::Ordering::Greater => {
                    for _ in 0..delta {
                        self.incr(log, log_pos);
                    }
                }
                std::cmp::Ordering::Less => {
                    for _ in 0..-delta {
                        self.decr(log, log_pos);
                    }
                }
                std::cmp::Ordering::Equal => {}
            }
        }
    }

    /// Whether the segment starting at `position` still holds live
    /// references.
    pub(crate) fn is_referenced(&self, position: u64) -> bool {
        self.refs.contains_key(&position)
    }

    /// Sorted `(segment position, count)` pairs, for diagnostics.
    pub(crate) fn counts(&self) -> Vec<(u64, u32)> {
        let mut counts: Vec<_> = self.refs.iter().map(|(&p, &c)| (p, c)).collect();
        counts.sort_unstable();
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordKind;

    #[test]
    fn counters_follow_segment_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny rotation threshold: every record its own segment.
        let log = RecordLog::open(dir.path(), 16, 1024).unwrap();
        let a = log.append(RecordKind::AddMessage, &[0u8; 32]).unwrap();
        let b = log.append(RecordKind::AddMessage, &[1u8; 32]).unwrap();

        let mut ledger = LogRefLedger::default();
        ledger.incr(&log, a);
        ledger.incr(&log, a);
        ledger.incr(&log, b);

        let seg_a = log.log_info(a).unwrap().position;
        let seg_b = log.log_info(b).unwrap().position;
        assert_ne!(seg_a, seg_b);
        assert_eq!(ledger.counts(), vec![(seg_a, 2), (seg_b, 1)]);

        ledger.decr(&log, a);
        assert!(ledger.is_referenced(seg_a));
        ledger.decr(&log, a);
        assert!(!ledger.is_referenced(seg_a));
        assert!(ledger.is_referenced(seg_b));
    }

    #[test]
    fn persists_as_stringified_positions() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordLog::open(dir.path().join("journal"), 1024, 1024).unwrap();
        let pos = log.append(RecordKind::AddMessage, b"m").unwrap();

        let config = crate::config::StoreConfig::new(dir.path());
        let index = Index::open(
            &dir.path().join("index"),
            &config,
            crate::config::IndexBackend::LevelDb,
        )
        .unwrap();

        let mut ledger = LogRefLedger::default();
        ledger.incr(&log, pos);
        ledger.save(&index, false).unwrap();

        let raw = index.get(None, LOG_REFS_KEY).unwrap().unwrap();
        let stored: HashMap<String, u32> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.get("0"), Some(&1));

        let reloaded = LogRefLedger::load(&index).unwrap();
        assert_eq!(reloaded.counts(), ledger.counts());
    }
}
