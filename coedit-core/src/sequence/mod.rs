//! Operation-based sequence CRDT for plain text.
//!
//! Every character is an [`Element`] with a unique [`Identifier`]. Deleted
//! characters stay in the sequence as tombstones so later inserts can still
//! find their anchors.
//!
//! ```text
//!  anchor        siblings sharing the anchor, priority descending
//!    │     ┌───────────────────────────────────────────────┐
//!    ▼     ▼                                               ▼
//!  [ h ] [ z:3 ] [ a:3 ] [ q:2 ] ... [ first char not anchored at h ]
//! ```
//!
//! A remote insert starts right after its anchor and walks past every
//! neighbour with higher priority (counter desc, then site id desc). Because
//! counters are Lamport clocks, descendants of a higher-priority sibling are
//! skipped along with it, so every replica settles on the same order.

pub mod id;
pub mod snapshot;

use std::cmp::Ordering;

pub use id::{Element, Identifier};
pub use snapshot::{ElementTuple, SequenceSnapshot, SnapshotError};

/// Result of a local insert: the new element and the anchor remote
/// replicas need to place it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInsert {
    pub element: Element,
    pub anchor: Option<Identifier>,
}

/// One replica of the sequence.
#[derive(Debug, Clone)]
pub struct Sequence {
    site_id: String,
    counter: u64,
    elements: Vec<Element>,
    /// UTF-8 size of the visible text.
    visible_bytes: usize,
}

impl Sequence {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            counter: 0,
            elements: Vec::new(),
            visible_bytes: 0,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Next counter this replica will stamp on a local insert.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// All elements in document order, tombstones included.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| e.is_visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// UTF-8 size of the visible text, maintained incrementally.
    pub fn content_bytes(&self) -> usize {
        self.visible_bytes
    }

    /// Insert `value` so that it becomes the `index`-th visible character.
    ///
    /// The element lands directly after the visible character it follows,
    /// which is the slot a remote replica computes from the returned anchor.
    /// Indexes past the end append after the last visible character.
    /// Returns `None` once the clock is exhausted.
    pub fn local_insert(&mut self, value: char, index: usize) -> Option<LocalInsert> {
        if self.counter == u64::MAX {
            log::warn!("[{}] Refusing insert: counter exhausted", self.site_id);
            return None;
        }

        let anchor_pos = match index {
            0 => None,
            n => self
                .position_of_visible(n - 1)
                .or_else(|| self.elements.iter().rposition(Element::is_visible)),
        };
        let insert_at = anchor_pos.map_or(0, |p| p + 1);
        let anchor = anchor_pos.map(|p| self.elements[p].id.clone());

        let element = Element::new(Identifier::new(self.site_id.clone(), self.counter), value);
        self.counter += 1;
        self.visible_bytes += value.len_utf8();
        self.elements.insert(insert_at, element.clone());

        Some(LocalInsert { element, anchor })
    }

    /// Tombstone the `index`-th visible character.
    pub fn local_delete(&mut self, index: usize) -> Option<Element> {
        let pos = self.position_of_visible(index)?;
        let element = &mut self.elements[pos];
        element.tombstone = true;
        self.visible_bytes -= element.value.len_utf8();
        Some(element.clone())
    }

    /// Integrate an element produced by another replica.
    ///
    /// Returns `false` when the operation was dropped: the anchor is not
    /// known yet, the element is already present, or its counter leaves no
    /// room for a successor.
    pub fn remote_insert(&mut self, element: Element, anchor: Option<&Identifier>) -> bool {
        if element.id.counter == u64::MAX {
            log::warn!("Dropping insert {}: counter exhausted", element.id);
            return false;
        }
        self.counter = self.counter.max(element.id.counter + 1);

        if self.position_of(&element.id).is_some() {
            return false;
        }

        let mut insert_at = match anchor {
            None => 0,
            Some(anchor_id) => match self.position_of(anchor_id) {
                Some(pos) => pos + 1,
                None => {
                    log::debug!("Dropping insert {}: anchor {} unknown", element.id, anchor_id);
                    return false;
                }
            },
        };

        while insert_at < self.elements.len()
            && self.elements[insert_at].id.priority_cmp(&element.id) == Ordering::Greater
        {
            insert_at += 1;
        }

        if element.is_visible() {
            self.visible_bytes += element.value.len_utf8();
        }
        self.elements.insert(insert_at, element);
        true
    }

    /// Tombstone the element with `id`. Unknown ids and repeated deletes
    /// are no-ops.
    pub fn remote_delete(&mut self, id: &Identifier) -> bool {
        match self.position_of(id) {
            Some(pos) if !self.elements[pos].tombstone => {
                self.elements[pos].tombstone = true;
                self.visible_bytes -= self.elements[pos].value.len_utf8();
                true
            }
            _ => false,
        }
    }

    /// Visible offset of the element with `id`, or `None` if unknown.
    pub fn visible_index_of(&self, id: &Identifier) -> Option<usize> {
        let pos = self.position_of(id)?;
        Some(self.elements[..pos].iter().filter(|e| e.is_visible()).count())
    }

    /// Visible text.
    pub fn to_text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| e.is_visible())
            .map(|e| e.value)
            .collect()
    }

    pub fn snapshot(&self) -> SequenceSnapshot {
        SequenceSnapshot::encode(&self.elements, self.counter)
    }

    /// Replace the whole replica state. The site id is kept.
    pub fn restore(&mut self, snapshot: &SequenceSnapshot) -> Result<(), SnapshotError> {
        self.elements = snapshot.decode()?;
        self.counter = snapshot.counter;
        self.visible_bytes = self
            .elements
            .iter()
            .filter(|e| e.is_visible())
            .map(|e| e.value.len_utf8())
            .sum();
        Ok(())
    }

    fn position_of(&self, id: &Identifier) -> Option<usize> {
        self.elements.iter().position(|e| &e.id == id)
    }

    fn position_of_visible(&self, index: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_visible())
            .nth(index)
            .map(|(pos, _)| pos)
    }
}
