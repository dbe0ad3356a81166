//! Ordered completion buffer for concurrently running async calls.

use std::collections::BTreeMap;

/// Releases completions in dispatch order, whatever order they finish in.
///
/// Every dispatch takes the next sequence number; completions are parked
/// until every earlier sequence number has been released.
///
/// # Example
///
/// ```rust
/// use context_flow::ReorderBuffer;
///
/// let mut buffer = ReorderBuffer::new();
/// let first = buffer.dispatch();
/// let second = buffer.dispatch();
///
/// buffer.complete(second, "b");
/// assert_eq!(buffer.pop_ready(), None);
///
/// buffer.complete(first, "a");
/// assert_eq!(buffer.pop_ready(), Some("a"));
/// assert_eq!(buffer.pop_ready(), Some("b"));
/// ```
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next_dispatch: u64,
    next_release: u64,
    completed: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_dispatch: 0,
            next_release: 0,
            completed: BTreeMap::new(),
        }
    }

    /// Reserve the next sequence number.
    pub fn dispatch(&mut self) -> u64 {
        let seq = self.next_dispatch;
        self.next_dispatch += 1;
        seq
    }

    /// Record the result for `seq`.
    ///
    /// Returns `false` when `seq` was never dispatched or was already
    /// released or cleared, in which case the value is dropped.
    pub fn complete(&mut self, seq: u64, value: T) -> bool {
        if seq < self.next_release || seq >= self.next_dispatch {
            return false;
        }
        self.completed.insert(seq, value);
        true
    }

    /// Release the next result in dispatch order, if it has completed.
    pub fn pop_ready(&mut self) -> Option<T> {
        let value = self.completed.remove(&self.next_release)?;
        self.next_release += 1;
        Some(value)
    }

    /// Dispatched but not yet released.
    pub fn in_flight(&self) -> usize {
        (self.next_dispatch - self.next_release) as usize
    }

    /// Completed results waiting for an earlier one.
    pub fn parked(&self) -> usize {
        self.completed.len()
    }

    /// Forget everything in flight; later completions for it are ignored.
    pub fn clear(&mut self) {
        self.completed.clear();
        self.next_release = self.next_dispatch;
    }
}
