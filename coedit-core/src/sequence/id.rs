//! Element identifiers.
//!
//! Each element in the sequence carries an identifier composed of:
//! - Site ID: the replica that created the element
//! - Counter: Lamport clock of that replica at creation time

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Globally unique identifier of an inserted element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
    pub site_id: String,
    pub counter: u64,
}

impl Identifier {
    pub fn new(site_id: impl Into<String>, counter: u64) -> Self {
        Self {
            site_id: site_id.into(),
            counter,
        }
    }

    /// Tie-break priority between siblings sharing an anchor.
    ///
    /// Higher counter wins, equal counters fall back to the site id.
    /// The greater identifier sits closer to the anchor.
    pub fn priority_cmp(&self, other: &Identifier) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.site_id.cmp(&other.site_id))
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.site_id, self.counter)
    }
}

/// A single character in the replicated sequence.
///
/// Elements are never removed; deletion flips `tombstone` and is never undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: Identifier,
    pub value: char,
    pub tombstone: bool,
}

impl Element {
    pub fn new(id: Identifier, value: char) -> Self {
        Self {
            id,
            value,
            tombstone: false,
        }
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        !self.tombstone
    }
}
