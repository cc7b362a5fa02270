use std::{num::NonZeroUsize, vec};

use machine_learning::MlErr;
use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use super::{Catalog, Entry, ExampleLoader, ShuffleBuffer};
use crate::{Result, WorkerErr};

/// A batch of examples, one per row, with one-hot labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// The infinite training sample stream of a single worker.
///
/// Every pass over the dataset lists the files in an order drawn from a generator seeded with
/// the worker's rank, then the listing goes through a shuffle buffer seeded the same way.
/// Passes are chained back to back and batches may span two of them, so how many steps make an
/// epoch is decided by the caller.
pub struct TrainStream<L> {
    catalog: Catalog,
    loader: L,
    listing_rng: StdRng,
    shuffle: ShuffleBuffer<Entry>,
    pass: vec::IntoIter<Entry>,
    batch_size: usize,
    passes: usize,
}

impl<L: ExampleLoader> TrainStream<L> {
    /// Creates a new `TrainStream`.
    ///
    /// # Arguments
    /// * `catalog` - The training dataset.
    /// * `loader` - Turns every file into input features.
    /// * `seed` - The worker's shuffling seed, its rank.
    /// * `shuffle_buffer_size` - The window of the shuffle buffer.
    /// * `batch_size` - The amount of examples per batch.
    ///
    /// # Returns
    /// A new `TrainStream` instance.
    pub fn new(
        catalog: Catalog,
        loader: L,
        seed: u64,
        shuffle_buffer_size: NonZeroUsize,
        batch_size: NonZeroUsize,
    ) -> Self {
        Self {
            catalog,
            loader,
            listing_rng: StdRng::seed_from_u64(seed),
            shuffle: ShuffleBuffer::new(shuffle_buffer_size, seed),
            pass: Vec::new().into_iter(),
            batch_size: batch_size.get(),
            passes: 0,
        }
    }

    /// Returns how many passes over the dataset have been started.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Picks the entries of the next batch without loading them.
    pub fn next_entries(&mut self) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(self.batch_size);

        while entries.len() < self.batch_size {
            match self.shuffle.next_from(&mut self.pass) {
                Some(entry) => entries.push(entry),
                None => {
                    self.pass = self
                        .catalog
                        .shuffled_listing(&mut self.listing_rng)
                        .into_iter();
                    self.passes += 1;
                }
            }
        }

        entries
    }

    /// Loads the next batch.
    ///
    /// # Returns
    /// The batch, or an error if any of its files fails to load.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let entries = self.next_entries();
        assemble(&self.loader, &entries, self.catalog.classes().len())
    }
}

impl<L: ExampleLoader> Iterator for TrainStream<L> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// The validation sample stream: path ordered, not shuffled and not repeating. The last batch
/// keeps whatever examples are left.
pub struct ValidationStream<L> {
    catalog: Catalog,
    loader: L,
    batch_size: usize,
    cursor: usize,
}

impl<L: ExampleLoader> ValidationStream<L> {
    /// Creates a new `ValidationStream`.
    ///
    /// # Arguments
    /// * `catalog` - The validation dataset, labeled with the training classes.
    /// * `loader` - Turns every file into input features.
    /// * `batch_size` - The amount of examples per batch.
    ///
    /// # Returns
    /// A new `ValidationStream` instance.
    pub fn new(catalog: Catalog, loader: L, batch_size: NonZeroUsize) -> Self {
        Self {
            catalog,
            loader,
            batch_size: batch_size.get(),
            cursor: 0,
        }
    }

    /// Keeps only the share of the split that worker `rank` of a fleet of `size` evaluates.
    pub fn shard(self, rank: usize, size: NonZeroUsize) -> Self {
        Self {
            catalog: self.catalog.shard(rank, size),
            cursor: 0,
            ..self
        }
    }

    /// Rewinds the stream to its first batch.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }
}

impl<L: ExampleLoader> Iterator for ValidationStream<L> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.catalog.entries();
        if self.cursor >= entries.len() {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(entries.len());
        let batch = assemble(
            &self.loader,
            &entries[self.cursor..end],
            self.catalog.classes().len(),
        );

        self.cursor = end;
        Some(batch)
    }
}

/// Loads `entries` in parallel, preserving their order.
fn assemble<L: ExampleLoader>(loader: &L, entries: &[Entry], classes: usize) -> Result<Batch> {
    let len = loader.example_len();
    if len == 0 {
        return Err(WorkerErr::Dataset(
            "examples must have at least one feature".into(),
        ));
    }

    let mut inputs = vec![0.0; entries.len() * len];
    inputs
        .par_chunks_mut(len)
        .zip(entries.par_iter())
        .try_for_each(|(row, entry)| loader.load_into(&entry.path, row))?;

    let mut labels = Array2::zeros((entries.len(), classes));
    for (i, entry) in entries.iter().enumerate() {
        if let Some(hot) = labels.get_mut((i, entry.label)) {
            *hot = 1.0;
        }
    }

    let inputs = Array2::from_shape_vec((entries.len(), len), inputs).map_err(MlErr::from)?;
    Ok(Batch { inputs, labels })
}
