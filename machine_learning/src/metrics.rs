/// The amount of top scoring classes checked by the top-k accuracy.
pub const TOP_K: usize = 5;

/// Running statistics of a model over one or more batches.
///
/// Sums are kept instead of means so that merging batches of different sizes stays exact.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub samples: usize,
    pub loss_sum: f64,
    pub correct: usize,
    pub top5_correct: usize,
}

impl BatchStats {
    /// Accumulates `other` into `self`.
    pub fn merge(&mut self, other: &BatchStats) {
        self.samples += other.samples;
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.top5_correct += other.top5_correct;
    }

    /// Returns the mean loss per sample, zero if there are no samples.
    pub fn loss(&self) -> f64 {
        self.ratio(self.loss_sum)
    }

    /// Returns the fraction of samples whose highest scoring class is the label.
    pub fn accuracy(&self) -> f64 {
        self.ratio(self.correct as f64)
    }

    /// Returns the fraction of samples whose label is among the `TOP_K` highest scoring classes.
    pub fn top5_accuracy(&self) -> f64 {
        self.ratio(self.top5_correct as f64)
    }

    fn ratio(&self, x: f64) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }

        x / self.samples as f64
    }
}
