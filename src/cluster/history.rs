//! Linear undo/redo history.
//!
//! Generic over the entry type so the partition engine and the metadata
//! layer share one stack: a constructor-supplied `combine` function folds the
//! diffs recorded by both aspects of a single user action into one entry.
//! The history is strictly linear -- recording after an undo discards the
//! redo tail for good.

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HistoryError {
    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,
}

/// A linear stack of applied entries with a cursor.
///
/// Entries below the cursor are applied; entries above it form the redo
/// tail. One `History` is constructed per opened dataset and dropped with
/// it; there is no process-global state.
pub struct History<T> {
    stack: Vec<T>,
    /// Number of applied entries (index one past the last applied one).
    cursor: usize,
    combine: Box<dyn Fn(Vec<T>) -> T>,
}

impl<T> History<T> {
    pub fn new(combine: impl Fn(Vec<T>) -> T + 'static) -> Self {
        Self {
            stack: Vec::new(),
            cursor: 0,
            combine: Box::new(combine),
        }
    }

    /// Combine the diffs of one user action into a single entry and push it,
    /// discarding any redo tail. Recording nothing is a no-op.
    pub fn record(&mut self, parts: Vec<T>) {
        if parts.is_empty() {
            return;
        }
        if self.cursor < self.stack.len() {
            let dropped = self.stack.len() - self.cursor;
            self.stack.truncate(self.cursor);
            debug!(dropped, "discarded redo tail");
        }
        self.stack.push((self.combine)(parts));
        self.cursor = self.stack.len();
    }

    /// Step the cursor back and return the entry that must be inverted.
    pub fn undo(&mut self) -> Result<&T, HistoryError> {
        if self.cursor == 0 {
            return Err(HistoryError::NothingToUndo);
        }
        self.cursor -= 1;
        Ok(&self.stack[self.cursor])
    }

    /// Step the cursor forward and return the entry to re-apply.
    pub fn redo(&mut self) -> Result<&T, HistoryError> {
        if self.cursor == self.stack.len() {
            return Err(HistoryError::NothingToRedo);
        }
        let entry = &self.stack[self.cursor];
        self.cursor += 1;
        Ok(entry)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.stack.len()
    }

    /// Total entries on the stack, applied or not.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Cursor position: number of currently applied entries.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// The applied entries, bottom of the stack to the cursor.
    pub fn applied(&self) -> &[T] {
        &self.stack[..self.cursor]
    }
}
