//! Custom engine: the operation-based [`Sequence`] exposed through
//! [`CrdtEngine`].

use super::{
    CrdtEngine, DeleteOp, EngineError, EngineKind, InsertOp, LocalEdit, OpRef, RemoteDelete,
    RemoteInsert, SequenceInsertOp, Snapshot,
};
use crate::sequence::Sequence;

#[derive(Debug, Clone)]
pub struct CustomEngine {
    sequence: Sequence,
}

impl CustomEngine {
    pub fn new(site_id: &str) -> Self {
        Self {
            sequence: Sequence::new(site_id),
        }
    }

    /// Underlying replica, for inspection.
    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }
}

impl CrdtEngine for CustomEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Custom
    }

    fn local_insert(&mut self, value: char, index: usize) -> Option<LocalEdit<InsertOp>> {
        let inserted = self.sequence.local_insert(value, index)?;
        let visible_index = self
            .sequence
            .visible_index_of(&inserted.element.id)
            .unwrap_or(index);
        Some(LocalEdit {
            op: InsertOp::Sequence(SequenceInsertOp {
                element: inserted.element,
                anchor: inserted.anchor,
            }),
            visible_index,
        })
    }

    fn local_delete(&mut self, index: usize) -> Option<LocalEdit<DeleteOp>> {
        let element = self.sequence.local_delete(index)?;
        Some(LocalEdit {
            op: DeleteOp::Sequence(element),
            visible_index: index,
        })
    }

    fn remote_insert(&mut self, op: &InsertOp) -> Option<RemoteInsert> {
        let InsertOp::Sequence(op) = op else {
            return None;
        };
        if !self
            .sequence
            .remote_insert(op.element.clone(), op.anchor.as_ref())
        {
            return None;
        }
        let visible_index = self.sequence.visible_index_of(&op.element.id)?;
        Some(RemoteInsert {
            visible_index,
            value: Some(op.element.value),
        })
    }

    fn remote_delete(&mut self, op: &DeleteOp) -> Option<RemoteDelete> {
        let DeleteOp::Sequence(element) = op else {
            return None;
        };
        // Position must be read before the element turns into a tombstone.
        let visible_index = self.sequence.visible_index_of(&element.id)?;
        self.sequence
            .remote_delete(&element.id)
            .then_some(RemoteDelete { visible_index })
    }

    fn visible_index_of(&self, target: OpRef<'_>) -> Option<usize> {
        match target {
            OpRef::Id(id) => self.sequence.visible_index_of(id),
            OpRef::Delta(_) => None,
        }
    }

    fn to_text(&self) -> String {
        self.sequence.to_text()
    }

    fn content_bytes(&self) -> usize {
        self.sequence.content_bytes()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::Sequence(self.sequence.snapshot())
    }

    fn restore(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        match snapshot {
            Snapshot::Sequence(s) => Ok(self.sequence.restore(s)?),
            other => Err(EngineError::EngineMismatch {
                expected: EngineKind::Custom,
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Identifier;

    #[test]
    fn test_local_edits_produce_wire_ops() {
        let mut engine = CustomEngine::new("client1");
        let edit = engine.local_insert('h', 0).unwrap();
        assert_eq!(edit.visible_index, 0);
        let InsertOp::Sequence(op) = edit.op else {
            panic!("custom engine must emit sequence ops");
        };
        assert_eq!(op.element.id, Identifier::new("client1", 0));
        assert_eq!(op.anchor, None);

        let deleted = engine.local_delete(0).unwrap();
        assert!(matches!(deleted.op, DeleteOp::Sequence(ref e) if e.tombstone));
        assert!(engine.local_delete(0).is_none());
    }

    #[test]
    fn test_remote_roundtrip_between_engines() {
        let mut origin = CustomEngine::new("a");
        let mut replica = CustomEngine::new("b");

        let first = origin.local_insert('x', 0).unwrap();
        let second = origin.local_insert('y', 1).unwrap();

        assert_eq!(
            replica.remote_insert(&first.op),
            Some(RemoteInsert { visible_index: 0, value: Some('x') })
        );
        assert_eq!(
            replica.remote_insert(&second.op),
            Some(RemoteInsert { visible_index: 1, value: Some('y') })
        );

        let delete = origin.local_delete(0).unwrap();
        assert_eq!(replica.remote_delete(&delete.op), Some(RemoteDelete { visible_index: 0 }));
        // Second delivery changes nothing.
        assert_eq!(replica.remote_delete(&delete.op), None);
        assert_eq!(replica.to_text(), "y");
    }

    #[test]
    fn test_foreign_ops_ignored() {
        let mut engine = CustomEngine::new("a");
        let delta = super::super::DeltaOp {
            update: String::new(),
            index: 0,
            value: Some('q'),
        };
        assert!(engine.remote_insert(&InsertOp::Delta(delta.clone())).is_none());
        assert!(engine.remote_delete(&DeleteOp::Delta(delta.clone())).is_none());
        assert!(engine.visible_index_of(OpRef::Delta(&delta)).is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut engine = CustomEngine::new("a");
        for (i, c) in "hey".chars().enumerate() {
            engine.local_insert(c, i).unwrap();
        }
        let mut fresh = CustomEngine::new("b");
        fresh.restore(&engine.snapshot()).unwrap();
        assert_eq!(fresh.to_text(), "hey");
        assert_eq!(fresh.sequence().counter(), 3);
    }
}
