//! Local undo/redo
//!
//! Only operations authored by the document's own replica are captured.
//! Steps are stored as identifiers, so undoing after remote edits still
//! touches the right characters.

use crate::crdt::{OpId, Operation, Update};
use crate::document::Document;
use crate::error::Result;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default window in which consecutive edits merge into one undo step
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
struct StackItem {
    /// Characters this step inserted
    inserted: Vec<OpId>,
    /// Characters this step deleted, with their content
    deleted: Vec<(OpId, char)>,
}

impl StackItem {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }
}

/// Undo/redo history for one local replica
#[derive(Debug)]
pub struct UndoManager {
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    capture_timeout: Duration,
    last_capture: Option<Instant>,
}

impl UndoManager {
    pub fn new() -> Self {
        Self::with_capture_timeout(DEFAULT_CAPTURE_TIMEOUT)
    }

    pub fn with_capture_timeout(capture_timeout: Duration) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            capture_timeout,
            last_capture: None,
        }
    }

    /// Record a local update produced by `doc`. Remote operations in the
    /// update are ignored. Clears the redo stack.
    pub fn record(&mut self, update: &Update, doc: &Document) {
        let step = Self::capture(update, doc);
        if step.is_empty() {
            return;
        }

        let now = Instant::now();
        let merge = self
            .last_capture
            .map(|at| now.duration_since(at) < self.capture_timeout)
            .unwrap_or(false);

        match self.undo_stack.last_mut() {
            Some(top) if merge => {
                top.inserted.extend(step.inserted);
                top.deleted.extend(step.deleted);
            }
            _ => self.undo_stack.push(step),
        }
        self.last_capture = Some(now);
        self.redo_stack.clear();
    }

    /// Start a new undo step on the next record regardless of timing
    pub fn stop_capturing(&mut self) {
        self.last_capture = None;
    }

    /// Revert the most recent local step. Returns the update to broadcast,
    /// or `None` when there is nothing left to undo.
    pub fn undo(&mut self, doc: &mut Document) -> Result<Option<Update>> {
        let result = Self::pop_and_revert(&mut self.undo_stack, &mut self.redo_stack, doc)?;
        self.last_capture = None;
        Ok(result)
    }

    /// Re-apply the most recently undone step
    pub fn redo(&mut self, doc: &mut Document) -> Result<Option<Update>> {
        let result = Self::pop_and_revert(&mut self.redo_stack, &mut self.undo_stack, doc)?;
        self.last_capture = None;
        Ok(result)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.last_capture = None;
    }

    fn capture(update: &Update, doc: &Document) -> StackItem {
        let local = doc.replica_id();
        let mut step = StackItem::default();
        for op in update.ops() {
            if op.id().replica != local {
                continue;
            }
            match op {
                Operation::Insert { id, content: Some(_), .. } => step.inserted.push(*id),
                Operation::Insert { .. } => {}
                Operation::Delete { target, .. } => {
                    if let Some(ch) = doc.content_of(*target) {
                        step.deleted.push((*target, ch));
                    }
                }
            }
        }
        step
    }

    /// Pop steps from `from` until one actually changes the document, push
    /// its inverse onto `to`.
    fn pop_and_revert(
        from: &mut Vec<StackItem>,
        to: &mut Vec<StackItem>,
        doc: &mut Document,
    ) -> Result<Option<Update>> {
        while let Some(step) = from.pop() {
            let (update, inverse) = Self::revert(&step, doc)?;
            if update.is_empty() {
                debug!("Skipping undo step already reverted by remote edits");
                continue;
            }
            to.push(inverse);
            return Ok(Some(update));
        }
        Ok(None)
    }

    fn revert(step: &StackItem, doc: &mut Document) -> Result<(Update, StackItem)> {
        let mut inverse = StackItem::default();

        let removed: Vec<(OpId, char)> = step
            .inserted
            .iter()
            .filter(|id| doc.is_visible(**id))
            .filter_map(|id| doc.content_of(*id).map(|ch| (*id, ch)))
            .collect();
        let ids: Vec<OpId> = removed.iter().map(|(id, _)| *id).collect();
        let delete_update = doc.delete_ids(&ids);
        inverse.deleted = removed;

        let mut restore_updates = Vec::with_capacity(step.deleted.len());
        for &(tombstone, ch) in &step.deleted {
            let update = doc.insert_after(Some(tombstone), &ch.to_string())?;
            inverse
                .inserted
                .extend(update.ops().iter().map(Operation::id));
            restore_updates.push(update);
        }

        let update = Update::merge(std::iter::once(delete_update).chain(restore_updates));
        Ok((update, inverse))
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}
