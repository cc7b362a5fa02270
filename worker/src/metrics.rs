use machine_learning::BatchStats;
use serde::Serialize;

/// The metrics of one epoch of one worker, or of the whole fleet once averaged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub top5_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_top5_accuracy: f64,
}

impl EpochMetrics {
    /// The amount of values `EpochMetrics::to_array` packs.
    pub const LEN: usize = 6;

    /// Summarizes the statistics accumulated through an epoch.
    pub fn from_stats(train: &BatchStats, validation: &BatchStats) -> Self {
        Self {
            loss: train.loss(),
            accuracy: train.accuracy(),
            top5_accuracy: train.top5_accuracy(),
            val_loss: validation.loss(),
            val_accuracy: validation.accuracy(),
            val_top5_accuracy: validation.top5_accuracy(),
        }
    }

    /// Packs the metrics into a buffer a collective can reduce.
    pub fn to_array(&self) -> [f32; Self::LEN] {
        [
            self.loss,
            self.accuracy,
            self.top5_accuracy,
            self.val_loss,
            self.val_accuracy,
            self.val_top5_accuracy,
        ]
        .map(|v| v as f32)
    }

    pub fn from_array(values: [f32; Self::LEN]) -> Self {
        let [
            loss,
            accuracy,
            top5_accuracy,
            val_loss,
            val_accuracy,
            val_top5_accuracy,
        ] = values.map(f64::from);

        Self {
            loss,
            accuracy,
            top5_accuracy,
            val_loss,
            val_accuracy,
            val_top5_accuracy,
        }
    }
}
