use ndarray::ArrayView2;
use rand::Rng;

use crate::{error::Result, metrics::BatchStats};

/// A trainable function over flat parameter buffers.
///
/// A model never owns its parameters, they live in a contiguous `[f32]` so that they can be
/// broadcast, averaged and checkpointed without knowing anything about the architecture.
pub trait Model {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    /// Returns the amount of features a single input example must have.
    fn input_len(&self) -> usize;

    /// Returns the amount of classes the model predicts.
    fn classes(&self) -> usize;

    /// Generates a fresh set of parameters for this model.
    ///
    /// # Arguments
    /// * `rng` - The random number generator used to sample the weights.
    ///
    /// # Returns
    /// A buffer of `self.size()` parameters, or an error if the initialization is invalid.
    fn init_params<R: Rng>(&self, rng: &mut R) -> Result<Vec<f32>>;

    /// Computes the gradient of the loss function with respect to the parameters of the model
    /// over one batch. `params` is left untouched, applying the gradient is up to the caller.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `inputs` - The batch inputs, one example per row.
    /// * `labels` - The one-hot labels, one example per row.
    /// * `grad` - A buffer for writing the computed gradient.
    ///
    /// # Returns
    /// The statistics of the forward pass.
    fn train_step(
        &mut self,
        params: &[f32],
        inputs: ArrayView2<f32>,
        labels: ArrayView2<f32>,
        grad: &mut [f32],
    ) -> Result<BatchStats>;

    /// Runs a forward pass without computing any gradient.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `inputs` - The batch inputs, one example per row.
    /// * `labels` - The one-hot labels, one example per row.
    ///
    /// # Returns
    /// The statistics of the forward pass.
    fn evaluate(
        &mut self,
        params: &[f32],
        inputs: ArrayView2<f32>,
        labels: ArrayView2<f32>,
    ) -> Result<BatchStats>;
}
