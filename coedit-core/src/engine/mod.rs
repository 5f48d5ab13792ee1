//! Interchangeable CRDT backends behind one contract.
//!
//! ```text
//!                ┌────────────────────┐
//!   session ───► │  dyn CrdtEngine    │ ◄─── protocol handler
//!                └─────────┬──────────┘
//!              ┌───────────┴────────────┐
//!              ▼                        ▼
//!      CustomEngine              StateDeltaEngine
//!   (op-based Sequence)       (yrs doc, binary deltas)
//! ```
//!
//! The backend is chosen once per process through [`EngineKind`]; every
//! document still owns its own instance. Callers never branch on which
//! backend is active.

pub mod custom;
pub mod state_delta;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sequence::{Element, Identifier, SequenceSnapshot, SnapshotError};

pub use custom::CustomEngine;
pub use state_delta::StateDeltaEngine;

/// Which backend a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EngineKind {
    #[default]
    #[serde(rename = "custom")]
    Custom,
    #[serde(rename = "state-delta", alias = "yjs")]
    StateDelta,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::StateDelta => "state-delta",
        }
    }

    /// Build a fresh engine instance for `site_id`.
    pub fn create(&self, site_id: &str) -> Box<dyn CrdtEngine> {
        match self {
            Self::Custom => Box::new(CustomEngine::new(site_id)),
            Self::StateDelta => Box::new(StateDeltaEngine::new(site_id)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom" => Ok(Self::Custom),
            "state-delta" | "yjs" => Ok(Self::StateDelta),
            other => Err(EngineError::UnknownEngine(other.to_string())),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire operations
// ───────────────────────────────────────────────────────────────────

/// Insert record of the custom engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInsertOp {
    pub element: Element,
    /// Predecessor at creation time; `None` inserts at the head.
    pub anchor: Option<Identifier>,
}

/// Binary delta of the state-delta engine, base64 encoded.
///
/// `index` is the visible character offset on the originating replica and
/// is used when the receiver cannot derive the position from the delta
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaOp {
    pub update: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<char>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertOp {
    Sequence(SequenceInsertOp),
    Delta(DeltaOp),
}

impl InsertOp {
    /// Upper bound on the UTF-8 bytes applying this op can add to the
    /// visible text. A v1 update stores inserted strings as UTF-8, so the
    /// decoded update is never smaller than the text it carries.
    pub fn content_bound(&self) -> usize {
        match self {
            Self::Sequence(op) => op.element.value.len_utf8(),
            Self::Delta(op) => (op.update.len() * 3).div_ceil(4),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeleteOp {
    /// The deleted element, as produced by the custom engine.
    Sequence(Element),
    Delta(DeltaOp),
}

/// Anything [`CrdtEngine::visible_index_of`] can locate.
#[derive(Debug, Clone, Copy)]
pub enum OpRef<'a> {
    Id(&'a Identifier),
    Delta(&'a DeltaOp),
}

/// Full state of a state-delta document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSnapshot {
    pub update: String,
    pub engine_type: EngineKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Snapshot {
    Delta(DeltaSnapshot),
    Sequence(SequenceSnapshot),
}

impl Snapshot {
    /// Engine this snapshot was produced by.
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Sequence(_) => EngineKind::Custom,
            Self::Delta(s) => s.engine_type,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Results
// ───────────────────────────────────────────────────────────────────

/// Outcome of a local edit: the op to broadcast and where it landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit<Op> {
    pub op: Op,
    pub visible_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInsert {
    pub visible_index: usize,
    pub value: Option<char>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteDelete {
    pub visible_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("snapshot belongs to the {found} engine, active engine is {expected}")]
    EngineMismatch {
        expected: EngineKind,
        found: EngineKind,
    },
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("unknown CRDT engine '{0}' (expected 'custom' or 'state-delta')")]
    UnknownEngine(String),
}

/// Uniform contract over both backends.
///
/// Every index is a visible character offset (Unicode scalar values), so
/// the same calls produce the same text on either backend. Operations of
/// the other backend's shape, and operations that reference state this
/// replica has not seen, are ignored and report `None`.
pub trait CrdtEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Insert `value` at visible offset `index`. `None` when the replica
    /// can no longer mint identifiers.
    fn local_insert(&mut self, value: char, index: usize) -> Option<LocalEdit<InsertOp>>;

    /// Delete the character at visible offset `index`.
    fn local_delete(&mut self, index: usize) -> Option<LocalEdit<DeleteOp>>;

    fn remote_insert(&mut self, op: &InsertOp) -> Option<RemoteInsert>;

    fn remote_delete(&mut self, op: &DeleteOp) -> Option<RemoteDelete>;

    fn visible_index_of(&self, target: OpRef<'_>) -> Option<usize>;

    fn to_text(&self) -> String;

    /// UTF-8 size of the visible text, without materializing it.
    fn content_bytes(&self) -> usize;

    fn snapshot(&self) -> Snapshot;

    /// Replace (custom) or merge (state-delta) replica state from a snapshot.
    fn restore(&mut self, snapshot: &Snapshot) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!("custom".parse::<EngineKind>().unwrap(), EngineKind::Custom);
        assert_eq!("State-Delta".parse::<EngineKind>().unwrap(), EngineKind::StateDelta);
        assert_eq!("yjs".parse::<EngineKind>().unwrap(), EngineKind::StateDelta);
        assert_eq!(
            "automerge".parse::<EngineKind>(),
            Err(EngineError::UnknownEngine("automerge".into()))
        );
    }

    #[test]
    fn test_engine_kind_wire_names() {
        assert_eq!(serde_json::to_string(&EngineKind::Custom).unwrap(), "\"custom\"");
        assert_eq!(
            serde_json::to_string(&EngineKind::StateDelta).unwrap(),
            "\"state-delta\""
        );
    }

    #[test]
    fn test_create_reports_kind() {
        assert_eq!(EngineKind::Custom.create("s").kind(), EngineKind::Custom);
        assert_eq!(EngineKind::StateDelta.create("s").kind(), EngineKind::StateDelta);
    }

    #[test]
    fn test_insert_op_shapes_are_distinguished() {
        let seq: InsertOp = serde_json::from_value(serde_json::json!({
            "element": { "id": { "siteId": "a", "counter": 0 }, "value": "x", "tombstone": false },
            "anchor": null
        }))
        .unwrap();
        assert!(matches!(seq, InsertOp::Sequence(_)));

        let delta: InsertOp =
            serde_json::from_value(serde_json::json!({ "update": "AAA=", "index": 3, "value": "x" }))
                .unwrap();
        assert!(matches!(delta, InsertOp::Delta(DeltaOp { index: 3, .. })));
    }

    #[test]
    fn test_content_bound() {
        let mut engine = CustomEngine::new("s");
        assert_eq!(engine.local_insert('é', 0).unwrap().op.content_bound(), 2);

        let delta = InsertOp::Delta(DeltaOp {
            update: "A".repeat(40),
            index: 0,
            value: Some('x'),
        });
        assert_eq!(delta.content_bound(), 30);
    }

    #[test]
    fn test_same_calls_same_text_on_every_engine() {
        let mut texts = Vec::new();
        for kind in [EngineKind::Custom, EngineKind::StateDelta] {
            let mut engine = kind.create("s");
            for (i, c) in "😀ab".chars().enumerate() {
                engine.local_insert(c, i).unwrap();
            }
            engine.local_insert('𝄞', 1).unwrap();
            assert_eq!(engine.local_delete(2).map(|e| e.visible_index), Some(2));
            assert_eq!(engine.content_bytes(), engine.to_text().len(), "engine {kind}");
            texts.push(engine.to_text());
        }
        assert_eq!(texts[0], "😀𝄞b");
        assert_eq!(texts[0], texts[1]);
    }

    #[test]
    fn test_snapshot_kind_detection() {
        let custom: Snapshot =
            serde_json::from_value(serde_json::json!({ "siteIds": [], "elements": [], "counter": 0 }))
                .unwrap();
        assert_eq!(custom.kind(), EngineKind::Custom);

        let delta: Snapshot =
            serde_json::from_value(serde_json::json!({ "update": "", "engineType": "state-delta" }))
                .unwrap();
        assert_eq!(delta.kind(), EngineKind::StateDelta);
    }

    #[test]
    fn test_every_engine_rejects_foreign_snapshot() {
        for kind in [EngineKind::Custom, EngineKind::StateDelta] {
            let foreign = match kind {
                EngineKind::Custom => EngineKind::StateDelta,
                EngineKind::StateDelta => EngineKind::Custom,
            };
            let snapshot = foreign.create("other").snapshot();
            let mut engine = kind.create("me");
            assert_eq!(
                engine.restore(&snapshot),
                Err(EngineError::EngineMismatch { expected: kind, found: foreign })
            );
        }
    }
}
