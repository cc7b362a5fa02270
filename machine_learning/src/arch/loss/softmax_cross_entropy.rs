use ndarray::{Array2, ArrayView2, Axis, Zip};

use crate::{
    MlErr, Result,
    metrics::{BatchStats, TOP_K},
};

// Keeps `ln` finite when a probability underflows.
const EPS: f32 = 1e-7;

/// Softmax followed by categorical cross entropy, computed together for numerical stability.
#[derive(Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    /// Returns a new `SoftmaxCrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    /// Computes the statistics of a batch of logits against its one-hot labels.
    ///
    /// # Arguments
    /// * `logits` - The raw model outputs, one example per row.
    /// * `y` - The one-hot labels.
    ///
    /// # Returns
    /// The batch statistics, or an error if the shapes differ or the batch is empty.
    pub fn stats(&self, logits: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<BatchStats> {
        Ok(self.forward(logits, y)?.0)
    }

    /// Computes the statistics of a batch and the derivative of the mean loss with respect to
    /// the logits, `(softmax(z) - y) / n`.
    ///
    /// # Arguments
    /// * `logits` - The raw model outputs, one example per row.
    /// * `y` - The one-hot labels.
    ///
    /// # Returns
    /// The batch statistics and the logits delta.
    pub fn forward(
        &self,
        logits: ArrayView2<f32>,
        y: ArrayView2<f32>,
    ) -> Result<(BatchStats, Array2<f32>)> {
        if logits.dim() != y.dim() {
            return Err(MlErr::SizeMismatch {
                a: "logits",
                b: "labels",
                got: logits.len(),
                expected: y.len(),
            });
        }

        let n = logits.nrows();
        if n == 0 {
            return Err(MlErr::EmptyBatch);
        }

        let mut probs = logits.to_owned();
        let mut stats = BatchStats {
            samples: n,
            ..Default::default()
        };

        for ((mut p, z), y) in probs
            .axis_iter_mut(Axis(0))
            .zip(logits.axis_iter(Axis(0)))
            .zip(y.axis_iter(Axis(0)))
        {
            let max = z.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            p.mapv_inplace(|v| (v - max).exp());
            let sum = p.sum();
            p /= sum;

            let label = argmax(y.iter().copied());
            let loss = -Zip::from(&p)
                .and(&y)
                .fold(0.0, |acc, &pi, &yi| acc + yi * pi.max(EPS).ln());
            stats.loss_sum += loss as f64;

            let target = z[label];
            let above = z.iter().filter(|&&v| v > target).count();
            if above == 0 {
                stats.correct += 1;
            }
            if above < TOP_K {
                stats.top5_correct += 1;
            }
        }

        let delta = (probs - &y) / n as f32;
        Ok((stats, delta))
    }
}

/// Returns the index of the largest value, the first one on ties.
fn argmax(values: impl Iterator<Item = f32>) -> usize {
    values
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, v)| {
            if v > max { (i, v) } else { (best, max) }
        })
        .0
}
