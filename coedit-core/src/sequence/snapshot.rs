//! Compact snapshot encoding for [`Sequence`](super::Sequence).
//!
//! Wire format (JSON):
//! ```text
//! {
//!   "siteIds":  ["client1", "server"],        site table, first-seen order
//!   "elements": [[0, 0, "a", 0], [1, 4, "b", 1]],
//!                 │  │   │    └─ tombstone flag (0 | 1)
//!                 │  │   └────── value
//!                 │  └────────── counter
//!                 └───────────── index into siteIds
//!   "counter":  5
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::id::{Element, Identifier};

/// Per-element tuple: `(site_index, counter, value, tombstone_flag)`.
pub type ElementTuple = (usize, u64, char, u8);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSnapshot {
    pub site_ids: Vec<String>,
    pub elements: Vec<ElementTuple>,
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("element {element} references site index {index}, table has {len} entries")]
    UnknownSite {
        element: usize,
        index: usize,
        len: usize,
    },
}

impl SequenceSnapshot {
    /// Encode elements, deduplicating site ids into a table.
    pub fn encode(elements: &[Element], counter: u64) -> Self {
        let mut site_index: HashMap<&str, usize> = HashMap::new();
        let mut site_ids = Vec::new();

        let elements = elements
            .iter()
            .map(|e| {
                let idx = *site_index.entry(e.id.site_id.as_str()).or_insert_with(|| {
                    site_ids.push(e.id.site_id.clone());
                    site_ids.len() - 1
                });
                (idx, e.id.counter, e.value, u8::from(e.tombstone))
            })
            .collect();

        Self {
            site_ids,
            elements,
            counter,
        }
    }

    /// Decode back into the ordered element list.
    pub fn decode(&self) -> Result<Vec<Element>, SnapshotError> {
        self.elements
            .iter()
            .enumerate()
            .map(|(pos, &(idx, counter, value, flag))| {
                let site = self.site_ids.get(idx).ok_or(SnapshotError::UnknownSite {
                    element: pos,
                    index: idx,
                    len: self.site_ids.len(),
                })?;
                Ok(Element {
                    id: Identifier::new(site.clone(), counter),
                    value,
                    tombstone: flag != 0,
                })
            })
            .collect()
    }
}
