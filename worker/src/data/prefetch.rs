use std::num::NonZeroUsize;

use log::debug;
use tokio::{sync::mpsc, task};

use super::Batch;
use crate::{Result, WorkerErr};

/// Loads batches ahead of the training loop on tokio's blocking pool.
///
/// At most `capacity` batches wait in the channel. The loading thread stops after handing over
/// the first error, or as soon as the `Prefetcher` is dropped.
pub struct Prefetcher {
    rx: mpsc::Receiver<Result<Batch>>,
}

impl Prefetcher {
    /// Starts loading batches from `source`, must be called within a tokio runtime.
    ///
    /// # Arguments
    /// * `source` - The batch source, usually a `TrainStream`.
    /// * `capacity` - How many batches can be loaded ahead.
    ///
    /// # Returns
    /// A new `Prefetcher` instance.
    pub fn spawn<S>(source: S, capacity: NonZeroUsize) -> Self
    where
        S: Iterator<Item = Result<Batch>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.get());

        task::spawn_blocking(move || {
            for batch in source {
                let failed = batch.is_err();
                if tx.blocking_send(batch).is_err() {
                    debug!("prefetcher dropped, stopping the loader");
                    return;
                }

                if failed {
                    return;
                }
            }
        });

        Self { rx }
    }

    /// Waits for the next batch.
    ///
    /// # Returns
    /// The batch, or the error that stopped the loader.
    pub async fn next(&mut self) -> Result<Batch> {
        match self.rx.recv().await {
            Some(batch) => batch,
            None => Err(WorkerErr::Dataset("the batch source ran dry".into())),
        }
    }
}
