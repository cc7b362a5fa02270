use std::{mem, num::NonZeroUsize};

use rand::{Rng, SeedableRng, rngs::StdRng};

/// A sliding window shuffle.
///
/// The buffer is filled with up to `capacity` items from upstream, then every output is a
/// uniformly chosen slot which gets refilled with the next upstream item. Once upstream runs
/// dry the buffer drains in random order.
///
/// The generator persists between upstream passes, so every pass is shuffled differently
/// while the whole sequence stays reproducible for a given seed.
#[derive(Debug)]
pub struct ShuffleBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    rng: StdRng,
}

impl<T> ShuffleBuffer<T> {
    /// Creates a new empty `ShuffleBuffer`.
    ///
    /// # Arguments
    /// * `capacity` - The size of the shuffling window.
    /// * `seed` - The seed of the generator picking slots.
    ///
    /// # Returns
    /// A new `ShuffleBuffer` instance.
    pub fn new(capacity: NonZeroUsize, seed: u64) -> Self {
        Self {
            slots: Vec::new(),
            capacity: capacity.get(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pulls the next shuffled item.
    ///
    /// # Arguments
    /// * `upstream` - The source of items, it must keep returning `None` once exhausted.
    ///
    /// # Returns
    /// The next item, or `None` once both upstream and the buffer are empty.
    pub fn next_from<I>(&mut self, upstream: &mut I) -> Option<T>
    where
        I: Iterator<Item = T>,
    {
        while self.slots.len() < self.capacity {
            match upstream.next() {
                Some(item) => self.slots.push(item),
                None => break,
            }
        }

        if self.slots.is_empty() {
            return None;
        }

        let i = self.rng.random_range(0..self.slots.len());
        let item = match upstream.next() {
            Some(next) => mem::replace(&mut self.slots[i], next),
            None => self.slots.swap_remove(i),
        };

        Some(item)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
