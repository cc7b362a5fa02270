use ndarray::ArrayView2;
use rand::Rng;

use super::{Model, layers::Dense, loss::SoftmaxCrossEntropy};
use crate::{MlErr, Result, initialization, metrics::BatchStats};

/// A softmax regression classifier: a single dense layer over the flattened input followed by
/// softmax cross entropy.
#[derive(Clone)]
pub struct Classifier {
    dense: Dense,
    loss: SoftmaxCrossEntropy,
}

impl Classifier {
    /// Creates a new `Classifier`.
    ///
    /// # Arguments
    /// * `input_len` - The amount of features of a flattened example.
    /// * `classes` - The amount of classes to predict.
    ///
    /// # Returns
    /// A new `Classifier` instance.
    pub fn new(input_len: usize, classes: usize) -> Self {
        Self {
            dense: Dense::new((input_len, classes)),
            loss: SoftmaxCrossEntropy::new(),
        }
    }

    fn check_labels(&self, labels: ArrayView2<f32>) -> Result<()> {
        if labels.ncols() != self.classes() {
            return Err(MlErr::SizeMismatch {
                a: "labels",
                b: "classes",
                got: labels.ncols(),
                expected: self.classes(),
            });
        }

        Ok(())
    }
}

impl Model for Classifier {
    fn size(&self) -> usize {
        self.dense.size()
    }

    fn input_len(&self) -> usize {
        self.dense.dim().0
    }

    fn classes(&self) -> usize {
        self.dense.dim().1
    }

    fn init_params<R: Rng>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = vec![0.; self.size()];
        let (weights, _biases) = params.split_at_mut(self.dense.weights_len());
        initialization::kaiming(rng, weights, self.input_len())?;
        Ok(params)
    }

    fn train_step(
        &mut self,
        params: &[f32],
        inputs: ArrayView2<f32>,
        labels: ArrayView2<f32>,
        grad: &mut [f32],
    ) -> Result<BatchStats> {
        self.check_labels(labels)?;

        let logits = self.dense.forward(params, inputs)?;
        let (stats, delta) = self.loss.forward(logits, labels)?;
        self.dense.backward(grad, delta.view())?;

        Ok(stats)
    }

    fn evaluate(
        &mut self,
        params: &[f32],
        inputs: ArrayView2<f32>,
        labels: ArrayView2<f32>,
    ) -> Result<BatchStats> {
        self.check_labels(labels)?;

        let logits = self.dense.forward(params, inputs)?;
        self.loss.stats(logits, labels)
    }
}
