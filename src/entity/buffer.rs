use std::collections::VecDeque;

/// FIFO of operations held while a durability call is outstanding.
///
/// Unbounded: nothing is ever dropped. Items stowed while a drain is in
/// progress queue up behind whatever the drain has not reached yet.
#[derive(Debug)]
pub struct PendingBuffer<T> {
    items: VecDeque<T>,
    high_water_mark: usize,
    total_stowed: u64,
}

impl<T> Default for PendingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingBuffer<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            high_water_mark: 0,
            total_stowed: 0,
        }
    }

    /// Appends `item` behind everything already held and returns the new length.
    pub fn stow(&mut self, item: T) -> usize {
        self.items.push_back(item);
        self.total_stowed = self.total_stowed.saturating_add(1);
        self.high_water_mark = self.high_water_mark.max(self.items.len());
        self.items.len()
    }

    /// Oldest held item, if any.
    pub fn pop_next(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Empties the buffer, oldest first.
    pub fn take_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Largest length the buffer has reached.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn total_stowed(&self) -> u64 {
        self.total_stowed
    }
}
