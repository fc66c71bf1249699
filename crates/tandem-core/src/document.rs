//! Replicated text document
//!
//! Characters live in an arena-backed doubly linked list in document order.
//! Every character remembers the identifiers of its left and right
//! neighbours at the moment it was inserted (`origin` / `right_origin`);
//! concurrent inserts between the same neighbours are ordered by replica id,
//! so every replica integrates them at the same place no matter the arrival
//! order. Deleted characters stay in the list as tombstones.

use crate::crdt::{OpId, Operation, ReplicaId, StateVector, Update};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Item {
    id: OpId,
    origin: Option<OpId>,
    right_origin: Option<OpId>,
    content: Option<char>,
    /// First delete operation that tombstoned this item
    deleted_by: Option<OpId>,
    left: Option<usize>,
    right: Option<usize>,
}

impl Item {
    fn is_visible(&self) -> bool {
        self.deleted_by.is_none() && self.content.is_some()
    }
}

/// Application order of every integrated operation
#[derive(Debug, Clone, Copy)]
enum Entry {
    Insert(usize),
    Delete { id: OpId, target: OpId },
}

/// Summary of what a remote update did to the document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Newly integrated insert operations
    pub inserted: usize,
    /// Newly integrated delete operations
    pub deleted: usize,
    /// Operations already known, skipped
    pub duplicates: usize,
    /// Operations waiting for missing dependencies
    pub pending: usize,
    /// Whether `current_text()` changed
    pub text_changed: bool,
}

impl ChangeSet {
    /// True when no new operation was integrated
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.deleted == 0
    }
}

/// Document statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentStats {
    pub items: usize,
    pub visible_len: usize,
    pub tombstones: usize,
    pub collected: usize,
    pub operations: usize,
    pub pending: usize,
}

/// A replicated, identifier-addressed character sequence
#[derive(Debug, Clone)]
pub struct Document {
    replica: ReplicaId,
    items: Vec<Item>,
    index: HashMap<OpId, usize>,
    head: Option<usize>,
    deletes: HashMap<OpId, OpId>,
    history: Vec<Entry>,
    state: StateVector,
    pending: Vec<Operation>,
    visible_len: usize,
    tombstones: usize,
    collected: usize,
}

impl Document {
    /// Create an empty document owned by `replica`
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            items: Vec::new(),
            index: HashMap::new(),
            head: None,
            deletes: HashMap::new(),
            history: Vec::new(),
            state: StateVector::new(),
            pending: Vec::new(),
            visible_len: 0,
            tombstones: 0,
            collected: 0,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// Number of visible characters
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn current_text(&self) -> String {
        let mut out = String::with_capacity(self.visible_len);
        for idx in self.iter_indices() {
            let item = &self.items[idx];
            if item.is_visible() {
                if let Some(ch) = item.content {
                    out.push(ch);
                }
            }
        }
        out
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> DocumentStats {
        DocumentStats {
            items: self.items.len(),
            visible_len: self.visible_len,
            tombstones: self.tombstones,
            collected: self.collected,
            operations: self.history.len(),
            pending: self.pending.len(),
        }
    }

    /// Character of an inserted item, if still held
    pub fn content_of(&self, id: OpId) -> Option<char> {
        self.index.get(&id).and_then(|&idx| self.items[idx].content)
    }

    /// Whether `id` names an inserted character that is currently visible
    pub fn is_visible(&self, id: OpId) -> bool {
        self.index
            .get(&id)
            .map(|&idx| self.items[idx].is_visible())
            .unwrap_or(false)
    }

    /// Visible offset of an inserted character
    pub fn offset_of(&self, id: OpId) -> Option<usize> {
        let target = *self.index.get(&id)?;
        if !self.items[target].is_visible() {
            return None;
        }
        let mut offset = 0;
        for idx in self.iter_indices() {
            if idx == target {
                return Some(offset);
            }
            if self.items[idx].is_visible() {
                offset += 1;
            }
        }
        None
    }

    /// Insert `text` so that its first character lands at visible offset `pos`
    pub fn apply_local_insert(&mut self, pos: usize, text: &str) -> Result<Update> {
        if pos > self.visible_len {
            return Err(Error::PositionOutOfRange { pos, len: self.visible_len });
        }
        let (left, right) = self.insertion_point(pos);
        let origin = left.map(|idx| self.items[idx].id);
        let right_origin = right.map(|idx| self.items[idx].id);
        Ok(self.insert_chain(origin, right_origin, text))
    }

    /// Insert `text` directly to the right of the item `anchor` (which may be
    /// a tombstone). `None` inserts at the very beginning.
    pub fn insert_after(&mut self, anchor: Option<OpId>, text: &str) -> Result<Update> {
        let right_origin = match anchor {
            Some(id) => {
                let idx = *self
                    .index
                    .get(&id)
                    .ok_or(Error::MissingDependency { op: id, missing: id })?;
                self.items[idx].right.map(|r| self.items[r].id)
            }
            None => self.head.map(|h| self.items[h].id),
        };
        Ok(self.insert_chain(anchor, right_origin, text))
    }

    /// Delete the visible characters in `range`
    pub fn apply_local_delete(&mut self, range: Range<usize>) -> Result<Update> {
        if range.start > range.end || range.end > self.visible_len {
            return Err(Error::PositionOutOfRange {
                pos: range.end.max(range.start),
                len: self.visible_len,
            });
        }
        let targets: Vec<OpId> = self
            .iter_indices()
            .filter(|&idx| self.items[idx].is_visible())
            .skip(range.start)
            .take(range.end - range.start)
            .map(|idx| self.items[idx].id)
            .collect();
        Ok(self.delete_chain(&targets))
    }

    /// Delete the given characters, skipping any that are already deleted
    pub fn delete_ids(&mut self, targets: &[OpId]) -> Update {
        let targets: Vec<OpId> = targets
            .iter()
            .copied()
            .filter(|id| self.is_visible(*id))
            .collect();
        self.delete_chain(&targets)
    }

    /// Integrate a remote update
    ///
    /// Operations already applied are skipped, operations whose
    /// dependencies are unknown wait in a pending buffer. An operation id
    /// reused with different content rejects the whole update before the
    /// document is touched.
    pub fn apply_remote_update(&mut self, update: &Update) -> Result<ChangeSet> {
        self.check_conflicts(update)?;

        let mut changes = ChangeSet::default();
        let mut queue: Vec<Operation> = Vec::with_capacity(update.len() + self.pending.len());
        let mut queued = HashSet::new();

        for op in update.ops().iter().chain(self.pending.iter()) {
            if self.state.contains(op.id()) {
                changes.duplicates += 1;
                continue;
            }
            if queued.insert(op.id()) {
                queue.push(op.clone());
            }
        }

        loop {
            let mut progressed = false;
            let mut waiting = Vec::new();
            for op in queue {
                if self.state.contains(op.id()) {
                    continue;
                }
                if self.is_ready(&op) {
                    match op {
                        Operation::Insert { .. } => changes.inserted += 1,
                        Operation::Delete { .. } => changes.deleted += 1,
                    }
                    changes.text_changed |= self.integrate(op);
                    progressed = true;
                } else {
                    waiting.push(op);
                }
            }
            queue = waiting;
            if !progressed || queue.is_empty() {
                break;
            }
        }

        if !queue.is_empty() {
            debug!(replica = self.replica, pending = queue.len(), "Buffering operations with missing dependencies");
        }
        changes.pending = queue.len();
        self.pending = queue;
        Ok(changes)
    }

    /// Strict check used by servers: the update must be fully applicable
    /// against this document without waiting for anything else.
    pub fn validate(&self, update: &Update) -> Result<()> {
        self.check_conflicts(update)?;

        let mut known = self.state.clone();
        let mut inserts: HashSet<OpId> = HashSet::new();
        let mut remaining: Vec<&Operation> = update
            .ops()
            .iter()
            .filter(|op| !self.state.contains(op.id()))
            .collect();

        loop {
            let before = remaining.len();
            remaining.retain(|op| {
                let id = op.id();
                if known.contains(id) {
                    return false;
                }
                let in_sequence = id.counter == known.get(id.replica) + 1;
                let refs_ok = op
                    .references()
                    .iter()
                    .all(|r| self.index.contains_key(r) || inserts.contains(r));
                if in_sequence && refs_ok {
                    known.observe(id);
                    if op.is_insert() {
                        inserts.insert(id);
                    }
                    false
                } else {
                    true
                }
            });
            if remaining.is_empty() {
                return Ok(());
            }
            if remaining.len() == before {
                break;
            }
        }

        let op = remaining[0];
        let id = op.id();
        let missing = if id.counter != known.get(id.replica) + 1 {
            OpId::new(id.replica, known.get(id.replica) + 1)
        } else {
            op.references()
                .into_iter()
                .find(|r| !self.index.contains_key(r) && !inserts.contains(r))
                .unwrap_or(id)
        };
        if known.contains(missing) {
            // Known id that is not an inserted character.
            return Err(Error::InvalidReference { op: id, target: missing });
        }
        Err(Error::MissingDependency { op: id, missing })
    }

    /// All operations not yet reflected in `peer`, in causal order
    pub fn compute_diff(&self, peer: &StateVector) -> Update {
        let ops = self
            .history
            .iter()
            .filter_map(|entry| {
                let op = self.entry_operation(entry);
                (!peer.contains(op.id())).then_some(op)
            })
            .collect();
        Update::new(ops)
    }

    /// Full document state as a single update
    pub fn encode_state_as_update(&self) -> Update {
        self.compute_diff(&StateVector::new())
    }

    /// Release the content of tombstones whose deletion every peer in
    /// `stable` has already applied. Identifiers stay resolvable.
    pub fn compact(&mut self, stable: &StateVector) -> usize {
        let mut released = 0;
        for item in &mut self.items {
            if let (Some(deleted_by), Some(_)) = (item.deleted_by, item.content) {
                if stable.contains(deleted_by) {
                    item.content = None;
                    released += 1;
                }
            }
        }
        self.tombstones -= released;
        self.collected += released;
        if released > 0 {
            debug!(replica = self.replica, released, "Collected tombstone content");
        }
        released
    }

    fn check_conflicts(&self, update: &Update) -> Result<()> {
        let mut seen: HashMap<OpId, &Operation> = HashMap::new();
        for op in update.ops() {
            let id = op.id();
            if let Some(previous) = seen.insert(id, op) {
                if !previous.same_as(op) {
                    return Err(Error::ConflictingOperation(id));
                }
            }
            if let Some(existing) = self.operation(id) {
                if !existing.same_as(op) {
                    return Err(Error::ConflictingOperation(id));
                }
            } else if let Some(waiting) = self.pending.iter().find(|p| p.id() == id) {
                if !waiting.same_as(op) {
                    return Err(Error::ConflictingOperation(id));
                }
            }
            for reference in op.references() {
                if self.deletes.contains_key(&reference) {
                    return Err(Error::InvalidReference { op: id, target: reference });
                }
            }
        }
        Ok(())
    }

    fn operation(&self, id: OpId) -> Option<Operation> {
        if let Some(&idx) = self.index.get(&id) {
            return Some(self.item_operation(idx));
        }
        self.deletes
            .get(&id)
            .map(|&target| Operation::Delete { id, target })
    }

    fn item_operation(&self, idx: usize) -> Operation {
        let item = &self.items[idx];
        Operation::Insert {
            id: item.id,
            origin: item.origin,
            right_origin: item.right_origin,
            content: item.content,
        }
    }

    fn entry_operation(&self, entry: &Entry) -> Operation {
        match *entry {
            Entry::Insert(idx) => self.item_operation(idx),
            Entry::Delete { id, target } => Operation::Delete { id, target },
        }
    }

    fn is_ready(&self, op: &Operation) -> bool {
        let id = op.id();
        if id.counter != self.state.get(id.replica) + 1 {
            return false;
        }
        op.references().iter().all(|r| self.index.contains_key(r))
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.replica, self.state.get(self.replica) + 1)
    }

    fn insert_chain(&mut self, origin: Option<OpId>, right_origin: Option<OpId>, text: &str) -> Update {
        let mut ops = Vec::with_capacity(text.chars().count());
        let mut origin = origin;
        for ch in text.chars() {
            let op = Operation::Insert {
                id: self.next_id(),
                origin,
                right_origin,
                content: Some(ch),
            };
            origin = Some(op.id());
            self.integrate(op.clone());
            ops.push(op);
        }
        trace!(replica = self.replica, chars = ops.len(), "Local insert");
        Update::new(ops)
    }

    fn delete_chain(&mut self, targets: &[OpId]) -> Update {
        let mut ops = Vec::with_capacity(targets.len());
        for &target in targets {
            let op = Operation::Delete { id: self.next_id(), target };
            self.integrate(op.clone());
            ops.push(op);
        }
        trace!(replica = self.replica, chars = ops.len(), "Local delete");
        Update::new(ops)
    }

    /// Apply an operation whose dependencies are all present.
    /// Returns whether the visible text changed.
    fn integrate(&mut self, op: Operation) -> bool {
        match op {
            Operation::Insert { id, origin, right_origin, content } => {
                self.integrate_insert(id, origin, right_origin, content);
                content.is_some()
            }
            Operation::Delete { id, target } => {
                let mut changed = false;
                if let Some(&idx) = self.index.get(&target) {
                    let item = &mut self.items[idx];
                    if item.deleted_by.is_none() {
                        item.deleted_by = Some(id);
                        if item.content.is_some() {
                            self.visible_len -= 1;
                            self.tombstones += 1;
                            changed = true;
                        }
                    }
                }
                self.deletes.insert(id, target);
                self.history.push(Entry::Delete { id, target });
                self.state.observe(id);
                changed
            }
        }
    }

    fn integrate_insert(
        &mut self,
        id: OpId,
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        content: Option<char>,
    ) {
        let origin_idx = origin.and_then(|o| self.index.get(&o).copied());
        let right_idx = right_origin.and_then(|r| self.index.get(&r).copied());

        let mut left = origin_idx;
        let first = match left {
            Some(l) => self.items[l].right,
            None => self.head,
        };

        if first != right_idx {
            let mut before_origin: HashSet<usize> = HashSet::new();
            let mut conflicting: HashSet<usize> = HashSet::new();
            let mut cursor = first;

            while let Some(o) = cursor {
                if Some(o) == right_idx {
                    break;
                }
                before_origin.insert(o);
                conflicting.insert(o);

                let other = &self.items[o];
                if other.origin == origin {
                    if other.id.replica < id.replica {
                        left = Some(o);
                        conflicting.clear();
                    } else if other.right_origin == right_origin {
                        break;
                    }
                } else if let Some(other_origin) =
                    other.origin.and_then(|oo| self.index.get(&oo).copied())
                {
                    if before_origin.contains(&other_origin) {
                        if !conflicting.contains(&other_origin) {
                            left = Some(o);
                            conflicting.clear();
                        }
                    } else {
                        break;
                    }
                } else {
                    break;
                }
                cursor = self.items[o].right;
            }
        }

        let idx = self.items.len();
        let right = match left {
            Some(l) => self.items[l].right,
            None => self.head,
        };
        self.items.push(Item {
            id,
            origin,
            right_origin,
            content,
            deleted_by: None,
            left,
            right,
        });
        match left {
            Some(l) => self.items[l].right = Some(idx),
            None => self.head = Some(idx),
        }
        if let Some(r) = right {
            self.items[r].left = Some(idx);
        }

        self.index.insert(id, idx);
        self.history.push(Entry::Insert(idx));
        self.state.observe(id);
        if content.is_some() {
            self.visible_len += 1;
        } else {
            self.collected += 1;
        }
    }

    /// Left and right list neighbours for an insert at visible offset `pos`
    fn insertion_point(&self, pos: usize) -> (Option<usize>, Option<usize>) {
        if pos == 0 {
            return (None, self.head);
        }
        let mut seen = 0;
        for idx in self.iter_indices() {
            if self.items[idx].is_visible() {
                seen += 1;
                if seen == pos {
                    return (Some(idx), self.items[idx].right);
                }
            }
        }
        (None, self.head)
    }

    fn iter_indices(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |&idx| self.items[idx].right)
    }
}
