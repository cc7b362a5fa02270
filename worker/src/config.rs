use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::{Path, PathBuf},
};

use crate::{
    Result, WorkerErr,
    schedule::{DecayStage, LrSchedule},
};

pub const DEFAULT_SHUFFLE_BUFFER_SIZE: usize = 12811;
pub const DEFAULT_PREFETCH_BUFFER_SIZE: usize = 1;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_WARMUP_EPOCHS: f64 = 5.0;
pub const DEFAULT_EPOCHS: usize = 90;
pub const DEFAULT_BASE_LR: f64 = 0.0125;
pub const DEFAULT_MOMENTUM: f32 = 0.9;
pub const DEFAULT_WEIGHT_DECAY: f32 = 5e-5;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_IMAGE_SIZE: u32 = 224;
pub const DEFAULT_DECAY_EPOCHS: [f64; 3] = [30.0, 60.0, 80.0];
pub const DEFAULT_DECAY_MULTIPLIERS: [f64; 4] = [1.0, 0.1, 0.01, 0.001];

/// Immutable settings of a training run, identical on every worker of the fleet.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub data_dir: PathBuf,
    pub logging_dir: PathBuf,
    pub shuffle_buffer_size: NonZeroUsize,
    pub prefetch_buffer_size: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub val_batch_size: NonZeroUsize,
    pub warmup_epochs: f64,
    pub epochs: usize,
    pub base_lr: f64,
    pub momentum: f32,
    pub weight_decay: f32,
    pub seed: u64,
    pub image_size: NonZeroU32,
    pub steps_per_epoch: Option<NonZeroUsize>,
    pub validation_steps: Option<NonZeroUsize>,
    pub decay_epochs: Vec<f64>,
    pub decay_multipliers: Vec<f64>,
}

impl TrainConfig {
    /// Creates a configuration with the reference benchmark defaults.
    ///
    /// # Arguments
    /// * `data_dir` - The dataset root, holding `train/` and `val/`.
    /// * `logging_dir` - Where checkpoints and metric events are written.
    ///
    /// # Returns
    /// A new `TrainConfig`.
    pub fn new(data_dir: impl Into<PathBuf>, logging_dir: impl Into<PathBuf>) -> Self {
        let nz = |n| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);

        Self {
            data_dir: data_dir.into(),
            logging_dir: logging_dir.into(),
            shuffle_buffer_size: nz(DEFAULT_SHUFFLE_BUFFER_SIZE),
            prefetch_buffer_size: nz(DEFAULT_PREFETCH_BUFFER_SIZE),
            batch_size: nz(DEFAULT_BATCH_SIZE),
            val_batch_size: nz(DEFAULT_BATCH_SIZE),
            warmup_epochs: DEFAULT_WARMUP_EPOCHS,
            epochs: DEFAULT_EPOCHS,
            base_lr: DEFAULT_BASE_LR,
            momentum: DEFAULT_MOMENTUM,
            weight_decay: DEFAULT_WEIGHT_DECAY,
            seed: DEFAULT_SEED,
            image_size: NonZeroU32::new(DEFAULT_IMAGE_SIZE).unwrap_or(NonZeroU32::MIN),
            steps_per_epoch: None,
            validation_steps: None,
            decay_epochs: DEFAULT_DECAY_EPOCHS.to_vec(),
            decay_multipliers: DEFAULT_DECAY_MULTIPLIERS.to_vec(),
        }
    }

    /// Checks every setting that doesn't depend on the fleet or the dataset.
    ///
    /// # Returns
    /// An error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if u32::try_from(self.epochs).is_err() {
            return Err(WorkerErr::Config(format!(
                "can't train for {} epochs",
                self.epochs
            )));
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(WorkerErr::Config(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }

        if !(self.weight_decay >= 0.0) {
            return Err(WorkerErr::Config(format!(
                "weight decay must be non negative, got {}",
                self.weight_decay
            )));
        }

        self.schedule(NonZeroUsize::MIN).map(|_| ())
    }

    /// Builds the learning rate schedule for a fleet of `num_workers`.
    pub fn schedule(&self, num_workers: NonZeroUsize) -> Result<LrSchedule> {
        let decay = DecayStage::from_thresholds(&self.decay_epochs, &self.decay_multipliers)?;
        LrSchedule::new(self.base_lr, num_workers, self.warmup_epochs, decay)
    }

    /// Returns the amount of training steps per epoch, derived from the dataset size unless
    /// configured explicitly. A derived epoch drops the examples that don't fill a global batch.
    ///
    /// # Arguments
    /// * `train_files` - The amount of training examples.
    /// * `size` - The amount of workers in the fleet.
    pub fn steps_per_epoch(&self, train_files: usize, size: usize) -> usize {
        match self.steps_per_epoch {
            Some(steps) => steps.get(),
            None => (train_files / global_batch(self.batch_size, size)).max(1),
        }
    }

    /// Returns the amount of validation steps per epoch, derived from the dataset size unless
    /// configured explicitly.
    ///
    /// Every worker validates its own shard of the split, a derived count is enough for each
    /// of them to go through its whole shard.
    ///
    /// # Arguments
    /// * `val_files` - The amount of validation examples.
    /// * `size` - The amount of workers in the fleet.
    pub fn validation_steps(&self, val_files: usize, size: usize) -> usize {
        match self.validation_steps {
            Some(steps) => steps.get(),
            None => val_files
                .div_ceil(global_batch(self.val_batch_size, size))
                .max(1),
        }
    }

    pub fn train_dir(&self) -> PathBuf {
        self.data_dir.join("train")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.data_dir.join("val")
    }

    pub fn logging_dir(&self) -> &Path {
        &self.logging_dir
    }
}

fn global_batch(batch_size: NonZeroUsize, size: usize) -> usize {
    batch_size.get() * size.max(1)
}
