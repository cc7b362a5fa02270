use comms::collective::Collective;
use log::debug;

use crate::{Result, WorkerErr, metrics::EpochMetrics, state::TrainingState};

/// Keeps the training state of every worker consistent through a collective.
///
/// Every method is a collective operation: all the workers of the fleet must call the same
/// methods in the same order, otherwise the transport reports a desync.
pub struct Synchronizer<C> {
    collective: C,
    state_synchronized: bool,
}

impl<C: Collective> Synchronizer<C> {
    /// Creates a new `Synchronizer`.
    ///
    /// # Arguments
    /// * `collective` - The transport connecting this worker to the fleet.
    ///
    /// # Returns
    /// A new `Synchronizer` instance.
    pub fn new(collective: C) -> Self {
        Self {
            collective,
            state_synchronized: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn size(&self) -> usize {
        self.collective.size()
    }

    /// Returns true once the initial state has been broadcast.
    pub fn is_state_synchronized(&self) -> bool {
        self.state_synchronized
    }

    /// Agrees on a control value, every worker ends up with the one held by `from`.
    ///
    /// # Arguments
    /// * `value` - This worker's value, only meaningful on `from`.
    /// * `from` - The rank whose value is kept.
    ///
    /// # Returns
    /// The value held by `from`.
    pub async fn broadcast_scalar(&mut self, value: u32, from: usize) -> Result<u32> {
        // Collectives move bytes without arithmetic, so the bit pattern survives.
        let mut buf = [f32::from_bits(value)];
        self.collective.broadcast(&mut buf, from).await?;
        Ok(buf[0].to_bits())
    }

    /// Overwrites the model and optimizer state of every worker with the one held by `from`.
    ///
    /// # Arguments
    /// * `state` - This worker's state, overwritten in place.
    /// * `from` - The rank holding the state to propagate.
    ///
    /// # Returns
    /// A collective error if the transport fails.
    pub async fn broadcast_state(&mut self, state: &mut TrainingState, from: usize) -> Result<()> {
        self.collective
            .broadcast(&mut state.model_parameters, from)
            .await?;

        self.collective
            .broadcast(state.optimizer.state_mut(), from)
            .await?;

        debug!(rank = self.rank(), from = from; "training state synchronized");
        self.state_synchronized = true;
        Ok(())
    }

    /// Replaces `grad` with the fleet wide average gradient.
    ///
    /// # Returns
    /// `WorkerErr::StateNotSynchronized` if called before `broadcast_state`, since stepping
    /// from unsynchronized weights diverges the workers for good.
    pub async fn average_gradients(&mut self, grad: &mut [f32]) -> Result<()> {
        if !self.state_synchronized {
            return Err(WorkerErr::StateNotSynchronized);
        }

        self.collective.allreduce_mean(grad).await?;
        Ok(())
    }

    /// Averages this worker's epoch metrics with the rest of the fleet's.
    ///
    /// # Arguments
    /// * `metrics` - The metrics computed over this worker's shard.
    ///
    /// # Returns
    /// The fleet wide metrics.
    pub async fn average_metrics(&mut self, metrics: &EpochMetrics) -> Result<EpochMetrics> {
        let mut values = metrics.to_array();
        self.collective.allreduce_mean(&mut values).await?;
        Ok(EpochMetrics::from_array(values))
    }

    /// Gives back the underlying collective.
    pub fn into_inner(self) -> C {
        self.collective
    }
}
