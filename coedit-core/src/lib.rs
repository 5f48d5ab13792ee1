//! # coedit-core: Replicated text for coedit
//!
//! The CRDT layer. Knows nothing about networking or sessions.
//!
//! ## Modules
//!
//! - [`sequence`]: Operation-based sequence CRDT (tombstones, tie-break merge, snapshots)
//! - [`engine`]: One contract over the custom sequence and the `yrs` state-delta backend

pub mod engine;
pub mod sequence;

pub use engine::{
    CrdtEngine, CustomEngine, DeleteOp, DeltaOp, DeltaSnapshot, EngineError, EngineKind,
    InsertOp, LocalEdit, OpRef, RemoteDelete, RemoteInsert, SequenceInsertOp, Snapshot,
    StateDeltaEngine,
};
pub use sequence::{Element, Identifier, LocalInsert, Sequence, SequenceSnapshot, SnapshotError};
