use std::num::NonZeroUsize;

use crate::{Result, WorkerErr};

/// One piece of the step decay: from `start_epoch` on, the target rate is scaled by
/// `multiplier` until the next stage starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayStage {
    pub start_epoch: f64,
    pub multiplier: f64,
}

impl DecayStage {
    /// Builds the decay stages out of the epochs where the rate drops and the multiplier of
    /// every resulting range, the first range starts at epoch 0.
    ///
    /// # Arguments
    /// * `thresholds` - The epochs where a new multiplier kicks in.
    /// * `multipliers` - One more multiplier than thresholds.
    ///
    /// # Returns
    /// The stages, or an error if the lengths don't fit each other.
    pub fn from_thresholds(thresholds: &[f64], multipliers: &[f64]) -> Result<Vec<Self>> {
        if multipliers.len() != thresholds.len() + 1 {
            return Err(WorkerErr::Config(format!(
                "{} decay thresholds need {} multipliers, got {}",
                thresholds.len(),
                thresholds.len() + 1,
                multipliers.len()
            )));
        }

        let starts = std::iter::once(0.0).chain(thresholds.iter().copied());
        Ok(starts
            .zip(multipliers)
            .map(|(start_epoch, &multiplier)| Self {
                start_epoch,
                multiplier,
            })
            .collect())
    }
}

/// The learning rate as a pure function of the epoch.
///
/// The target rate follows the linear scaling rule, `base_lr * num_workers`. During warmup the
/// rate ramps linearly from `base_lr` to the target, afterwards it's the target scaled by the
/// multiplier of the current decay stage. Decay boundaries are instantaneous.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    base_lr: f64,
    num_workers: NonZeroUsize,
    warmup_epochs: f64,
    decay: Vec<DecayStage>,
}

impl LrSchedule {
    /// Creates a new `LrSchedule`.
    ///
    /// # Arguments
    /// * `base_lr` - The single worker learning rate.
    /// * `num_workers` - The size of the fleet, fixed for the whole run.
    /// * `warmup_epochs` - The length of the warmup ramp, fractional epochs allowed.
    /// * `decay` - The decay stages, the first one starting at epoch 0.
    ///
    /// # Returns
    /// The schedule, or an error if the rates aren't positive, the stage starts aren't
    /// strictly increasing or the multipliers increase.
    pub fn new(
        base_lr: f64,
        num_workers: NonZeroUsize,
        warmup_epochs: f64,
        decay: Vec<DecayStage>,
    ) -> Result<Self> {
        if !(base_lr.is_finite() && base_lr > 0.0) {
            return Err(WorkerErr::Config(format!(
                "the base learning rate must be positive, got {base_lr}"
            )));
        }

        if !(warmup_epochs.is_finite() && warmup_epochs >= 0.0) {
            return Err(WorkerErr::Config(format!(
                "the warmup must last a non negative amount of epochs, got {warmup_epochs}"
            )));
        }

        match decay.first() {
            Some(first) if first.start_epoch == 0.0 => {}
            _ => {
                return Err(WorkerErr::Config(
                    "the first decay stage must start at epoch 0".into(),
                ));
            }
        }

        for pair in decay.windows(2) {
            let (prev, next) = (pair[0], pair[1]);

            if next.start_epoch <= prev.start_epoch {
                return Err(WorkerErr::Config(format!(
                    "decay thresholds must be strictly increasing, {} follows {}",
                    next.start_epoch, prev.start_epoch
                )));
            }

            if next.multiplier > prev.multiplier {
                return Err(WorkerErr::Config(format!(
                    "decay multipliers must not increase, {} follows {}",
                    next.multiplier, prev.multiplier
                )));
            }
        }

        if let Some(stage) = decay.iter().find(|s| !(s.multiplier > 0.0)) {
            return Err(WorkerErr::Config(format!(
                "decay multipliers must be positive, got {}",
                stage.multiplier
            )));
        }

        Ok(Self {
            base_lr,
            num_workers,
            warmup_epochs,
            decay,
        })
    }

    /// Returns the rate every worker reaches once warmup is over, before any decay.
    pub fn target_lr(&self) -> f64 {
        self.base_lr * self.num_workers.get() as f64
    }

    /// Computes the learning rate for `epoch`.
    pub fn effective_lr(&self, epoch: f64) -> f64 {
        let target = self.target_lr();

        if epoch < self.warmup_epochs {
            let fraction = epoch.max(0.0) / self.warmup_epochs;
            return self.base_lr + (target - self.base_lr) * fraction;
        }

        target * self.multiplier(epoch)
    }

    fn multiplier(&self, epoch: f64) -> f64 {
        self.decay
            .iter()
            .take_while(|stage| stage.start_epoch <= epoch)
            .last()
            .map_or(1.0, |stage| stage.multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imagenet_schedule(num_workers: usize) -> LrSchedule {
        let decay =
            DecayStage::from_thresholds(&[30.0, 60.0, 80.0], &[1.0, 0.1, 0.01, 0.001]).unwrap();
        LrSchedule::new(0.0125, NonZeroUsize::new(num_workers).unwrap(), 5.0, decay).unwrap()
    }

    fn assert_close(got: f64, expected: f64) {
        assert!(
            (got - expected).abs() <= expected.abs() * 1e-12,
            "got {got}, expected {expected}"
        );
    }

    #[test]
    fn reference_rates_for_four_workers() {
        let schedule = imagenet_schedule(4);

        assert_eq!(schedule.effective_lr(0.0), 0.0125);
        assert_close(schedule.effective_lr(5.0), 0.05);
        assert_close(schedule.effective_lr(40.0), 0.005);
        assert_close(schedule.effective_lr(85.0), 0.00005);
    }

    #[test]
    fn warmup_is_monotonic_and_decay_never_increases() {
        let schedule = imagenet_schedule(8);

        let warmup: Vec<f64> = (0..=50)
            .map(|i| schedule.effective_lr(i as f64 * 0.1))
            .collect();
        assert!(warmup.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(schedule.effective_lr(5.0), schedule.target_lr());

        let decay: Vec<f64> = (5..90).map(|e| schedule.effective_lr(e as f64)).collect();
        assert!(decay.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn boundaries_are_instantaneous() {
        let schedule = imagenet_schedule(1);

        assert_close(schedule.effective_lr(29.999), 0.0125);
        assert_close(schedule.effective_lr(30.0), 0.00125);
    }

    #[test]
    fn no_warmup_starts_at_the_target() {
        let decay = DecayStage::from_thresholds(&[], &[1.0]).unwrap();
        let schedule = LrSchedule::new(0.1, NonZeroUsize::new(2).unwrap(), 0.0, decay).unwrap();

        assert_close(schedule.effective_lr(0.0), 0.2);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        let n = NonZeroUsize::new(1).unwrap();
        let stages = |t: &[f64], m: &[f64]| DecayStage::from_thresholds(t, m).unwrap();

        assert!(DecayStage::from_thresholds(&[30.0], &[1.0]).is_err());
        assert!(LrSchedule::new(0.0, n, 5.0, stages(&[], &[1.0])).is_err());
        assert!(LrSchedule::new(0.1, n, -1.0, stages(&[], &[1.0])).is_err());
        assert!(LrSchedule::new(0.1, n, 5.0, stages(&[60.0, 30.0], &[1.0, 0.1, 0.01])).is_err());
        assert!(LrSchedule::new(0.1, n, 5.0, stages(&[30.0], &[0.1, 1.0])).is_err());
        assert!(LrSchedule::new(0.1, n, 5.0, Vec::new()).is_err());
    }
}
