//! State-delta engine backed by a `yrs` document.
//!
//! Local edits run inside a write transaction whose v1 update is shipped as
//! the wire op. Remote deltas are merged through `apply_update`; the visible
//! offset they touched is read from a text observer installed for the
//! duration of the merge.
//!
//! The document counts offsets in UTF-16 units. The engine contract speaks
//! in characters, so offsets are converted at this boundary.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use yrs::types::Delta;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Observable, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef,
    Transact, Update,
};

use super::{
    CrdtEngine, DeleteOp, DeltaOp, DeltaSnapshot, EngineError, EngineKind, InsertOp, LocalEdit,
    OpRef, RemoteDelete, RemoteInsert, Snapshot,
};

/// Name of the shared text root inside every document.
pub const TEXT_ROOT: &str = "content";

const NOT_OBSERVED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Insert,
    Delete,
}

/// UTF-16 offset of the `chars`-th character of `text`.
fn utf16_offset(text: &str, chars: usize) -> u32 {
    text.chars().take(chars).map(char::len_utf16).sum::<usize>() as u32
}

/// Character index at UTF-16 offset `units` of `text`.
fn char_index(text: &str, units: usize) -> usize {
    let mut seen = 0;
    for (i, c) in text.chars().enumerate() {
        if seen >= units {
            return i;
        }
        seen += c.len_utf16();
    }
    text.chars().count()
}

pub struct StateDeltaEngine {
    site_id: String,
    doc: Doc,
    text: TextRef,
    bytes: usize,
}

impl StateDeltaEngine {
    pub fn new(site_id: &str) -> Self {
        let options = Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        };
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self {
            site_id: site_id.to_string(),
            doc,
            text,
            bytes: 0,
        }
    }

    fn current_text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Merge a delta, returning the character offset of the first `change`
    /// the text observer saw. `None` when the delta was dropped or left the
    /// visible text untouched.
    fn apply_delta(&mut self, op: &DeltaOp, change: Change) -> Option<usize> {
        let bytes = match BASE64.decode(&op.update) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[{}] Dropping delta with invalid base64: {e}", self.site_id);
                return None;
            }
        };
        let update = match Update::decode_v1(&bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("[{}] Dropping undecodable delta: {e}", self.site_id);
                return None;
            }
        };

        let observed = Arc::new(AtomicUsize::new(NOT_OBSERVED));
        let sink = observed.clone();
        let subscription = self.text.observe(move |txn, event| {
            let mut pos = 0usize;
            for d in event.delta(txn) {
                match d {
                    Delta::Retain(n, _) => pos += *n as usize,
                    Delta::Inserted(..) if change == Change::Insert => {
                        sink.store(pos, Ordering::Relaxed);
                        break;
                    }
                    Delta::Deleted(_) if change == Change::Delete => {
                        sink.store(pos, Ordering::Relaxed);
                        break;
                    }
                    _ => {}
                }
            }
        });

        let merged = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        drop(subscription);

        let text = self.current_text();
        let before = std::mem::replace(&mut self.bytes, text.len());
        if let Err(e) = merged {
            log::warn!("[{}] Dropping delta that failed to integrate: {e}", self.site_id);
            return None;
        }

        // Text before the touched offset is unchanged by the merge, so the
        // merged text converts the observed offset.
        match observed.load(Ordering::Relaxed) {
            NOT_OBSERVED if before == self.bytes => None,
            NOT_OBSERVED => Some(op.index.min(text.chars().count())),
            units => Some(char_index(&text, units)),
        }
    }
}

impl fmt::Debug for StateDeltaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDeltaEngine")
            .field("site_id", &self.site_id)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl CrdtEngine for StateDeltaEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::StateDelta
    }

    fn local_insert(&mut self, value: char, index: usize) -> Option<LocalEdit<InsertOp>> {
        let current = self.current_text();
        let index = index.min(current.chars().count());
        let offset = utf16_offset(&current, index);
        let update = {
            let mut txn = self.doc.transact_mut();
            self.text.insert(&mut txn, offset, value.encode_utf8(&mut [0; 4]));
            txn.encode_update_v1()
        };
        self.bytes += value.len_utf8();
        Some(LocalEdit {
            op: InsertOp::Delta(DeltaOp {
                update: BASE64.encode(update),
                index,
                value: Some(value),
            }),
            visible_index: index,
        })
    }

    fn local_delete(&mut self, index: usize) -> Option<LocalEdit<DeleteOp>> {
        let current = self.current_text();
        let deleted = current.chars().nth(index)?;
        let offset = utf16_offset(&current, index);
        let update = {
            let mut txn = self.doc.transact_mut();
            self.text
                .remove_range(&mut txn, offset, deleted.len_utf16() as u32);
            txn.encode_update_v1()
        };
        self.bytes -= deleted.len_utf8();
        Some(LocalEdit {
            op: DeleteOp::Delta(DeltaOp {
                update: BASE64.encode(update),
                index,
                value: None,
            }),
            visible_index: index,
        })
    }

    fn remote_insert(&mut self, op: &InsertOp) -> Option<RemoteInsert> {
        let InsertOp::Delta(op) = op else {
            return None;
        };
        let visible_index = self.apply_delta(op, Change::Insert)?;
        Some(RemoteInsert {
            visible_index,
            value: op.value,
        })
    }

    fn remote_delete(&mut self, op: &DeleteOp) -> Option<RemoteDelete> {
        let DeleteOp::Delta(op) = op else {
            return None;
        };
        let visible_index = self.apply_delta(op, Change::Delete)?;
        Some(RemoteDelete { visible_index })
    }

    fn visible_index_of(&self, target: OpRef<'_>) -> Option<usize> {
        match target {
            OpRef::Delta(op) => Some(op.index),
            OpRef::Id(_) => None,
        }
    }

    fn to_text(&self) -> String {
        self.current_text()
    }

    fn content_bytes(&self) -> usize {
        self.bytes
    }

    fn snapshot(&self) -> Snapshot {
        let state = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        Snapshot::Delta(DeltaSnapshot {
            update: BASE64.encode(state),
            engine_type: EngineKind::StateDelta,
        })
    }

    fn restore(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        let snap = match snapshot {
            Snapshot::Delta(s) if s.engine_type == EngineKind::StateDelta => s,
            other => {
                return Err(EngineError::EngineMismatch {
                    expected: EngineKind::StateDelta,
                    found: other.kind(),
                })
            }
        };
        let bytes = BASE64
            .decode(&snap.update)
            .map_err(|e| EngineError::InvalidSnapshot(e.to_string()))?;
        let update =
            Update::decode_v1(&bytes).map_err(|e| EngineError::InvalidSnapshot(e.to_string()))?;
        let merged = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        self.bytes = self.current_text().len();
        merged.map_err(|e| EngineError::InvalidSnapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_text(engine: &mut StateDeltaEngine, text: &str) -> Vec<InsertOp> {
        text.chars()
            .enumerate()
            .map(|(i, c)| engine.local_insert(c, i).unwrap().op)
            .collect()
    }

    #[test]
    fn test_local_insert_emits_delta() {
        let mut engine = StateDeltaEngine::new("a");
        let edit = engine.local_insert('h', 0).unwrap();
        assert_eq!(edit.visible_index, 0);
        let InsertOp::Delta(op) = edit.op else {
            panic!("state-delta engine must emit delta ops");
        };
        assert!(!op.update.is_empty());
        assert_eq!(op.value, Some('h'));
        assert_eq!(engine.to_text(), "h");
    }

    #[test]
    fn test_local_insert_clamps_index() {
        let mut engine = StateDeltaEngine::new("a");
        type_text(&mut engine, "ab");
        let edit = engine.local_insert('c', 40).unwrap();
        assert_eq!(edit.visible_index, 2);
        assert_eq!(engine.to_text(), "abc");
    }

    #[test]
    fn test_local_delete_bounds() {
        let mut engine = StateDeltaEngine::new("a");
        type_text(&mut engine, "ab");
        assert!(engine.local_delete(2).is_none());
        let edit = engine.local_delete(0).unwrap();
        assert_eq!(edit.visible_index, 0);
        assert_eq!(engine.to_text(), "b");
    }

    #[test]
    fn test_remote_ops_report_observed_offsets() {
        let mut origin = StateDeltaEngine::new("origin");
        let mut replica = StateDeltaEngine::new("replica");

        for op in type_text(&mut origin, "abc") {
            assert!(replica.remote_insert(&op).is_some());
        }
        let middle = origin.local_insert('X', 2).unwrap();
        let applied = replica.remote_insert(&middle.op).unwrap();
        assert_eq!(applied.visible_index, 2);
        assert_eq!(applied.value, Some('X'));

        let delete = origin.local_delete(1).unwrap();
        assert_eq!(replica.remote_delete(&delete.op), Some(RemoteDelete { visible_index: 1 }));
        assert_eq!(replica.to_text(), "aXc");
        assert_eq!(replica.to_text(), origin.to_text());
    }

    #[test]
    fn test_offsets_count_characters() {
        let mut origin = StateDeltaEngine::new("origin");
        let mut replica = StateDeltaEngine::new("replica");
        for op in type_text(&mut origin, "😀😀") {
            assert!(replica.remote_insert(&op).is_some());
        }

        let edit = origin.local_insert('x', 1).unwrap();
        assert_eq!(origin.to_text(), "😀x😀");
        assert_eq!(replica.remote_insert(&edit.op).map(|r| r.visible_index), Some(1));

        let delete = origin.local_delete(2).unwrap();
        assert_eq!(replica.remote_delete(&delete.op), Some(RemoteDelete { visible_index: 2 }));
        assert_eq!(replica.to_text(), "😀x");
        assert_eq!(replica.content_bytes(), 5);
        assert_eq!(origin.content_bytes(), 5);
    }

    #[test]
    fn test_pending_delta_reports_nothing_until_integrated() {
        let mut origin = StateDeltaEngine::new("origin");
        let mut replica = StateDeltaEngine::new("replica");
        let ops = type_text(&mut origin, "ab");

        // The second delta depends on the first and waits inside the doc.
        assert!(replica.remote_insert(&ops[1]).is_none());
        assert_eq!(replica.to_text(), "");

        let applied = replica.remote_insert(&ops[0]).unwrap();
        assert_eq!(applied.visible_index, 0);
        assert_eq!(replica.to_text(), "ab");

        // Redelivery changes nothing and reports nothing.
        assert!(replica.remote_insert(&ops[0]).is_none());
        assert_eq!(replica.content_bytes(), 2);
    }

    #[test]
    fn test_garbage_delta_dropped() {
        let mut engine = StateDeltaEngine::new("a");
        let op = DeltaOp {
            update: "not base64!!".into(),
            index: 0,
            value: Some('z'),
        };
        assert!(engine.remote_insert(&InsertOp::Delta(op)).is_none());
        assert_eq!(engine.to_text(), "");
    }

    #[test]
    fn test_snapshot_restore() {
        let mut engine = StateDeltaEngine::new("a");
        type_text(&mut engine, "state");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.kind(), EngineKind::StateDelta);

        let mut fresh = StateDeltaEngine::new("b");
        fresh.restore(&snapshot).unwrap();
        assert_eq!(fresh.to_text(), "state");
        assert_eq!(fresh.content_bytes(), 5);
    }

    #[test]
    fn test_restore_rejects_corrupt_payload() {
        let mut engine = StateDeltaEngine::new("a");
        let snapshot = Snapshot::Delta(DeltaSnapshot {
            update: "%%%".into(),
            engine_type: EngineKind::StateDelta,
        });
        assert!(matches!(
            engine.restore(&snapshot),
            Err(EngineError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_visible_index_of_uses_carried_offset() {
        let engine = StateDeltaEngine::new("a");
        let op = DeltaOp {
            update: String::new(),
            index: 7,
            value: None,
        };
        assert_eq!(engine.visible_index_of(OpRef::Delta(&op)), Some(7));
    }
}
