use machine_learning::{
    MlErr,
    arch::Model,
    optimization::Sgd,
};
use rand::{SeedableRng, rngs::StdRng};

use crate::Result;

/// The training state, logically one across the fleet: after every synchronization point all
/// workers hold bit identical copies of it.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Amount of epochs completed.
    pub current_epoch: usize,
    pub model_parameters: Vec<f32>,
    pub optimizer: Sgd,
}

impl TrainingState {
    /// Creates a state with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `model` - The model the parameters belong to.
    /// * `optimizer` - A fresh optimizer for `model.size()` parameters.
    /// * `seed` - The seed of the weight initialization.
    ///
    /// # Returns
    /// The new state, or an error if the model can't be initialized.
    pub fn fresh<M: Model>(model: &M, optimizer: Sgd, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let model_parameters = model.init_params(&mut rng)?;
        Self::with_parameters(model_parameters, optimizer)
    }

    /// Creates a zeroed state, a placeholder to be overwritten by a broadcast.
    pub fn zeroed<M: Model>(model: &M, optimizer: Sgd) -> Result<Self> {
        Self::with_parameters(vec![0.; model.size()], optimizer)
    }

    fn with_parameters(model_parameters: Vec<f32>, optimizer: Sgd) -> Result<Self> {
        if model_parameters.len() != optimizer.state().len() {
            return Err(MlErr::SizeMismatch {
                a: "model parameters",
                b: "optimizer state",
                got: model_parameters.len(),
                expected: optimizer.state().len(),
            }
            .into());
        }

        Ok(Self {
            current_epoch: 0,
            model_parameters,
            optimizer,
        })
    }

    pub fn optimizer_parameters(&self) -> &[f32] {
        self.optimizer.state()
    }

    /// Overwrites this state with one restored from a checkpoint.
    ///
    /// # Arguments
    /// * `epoch` - The amount of epochs the restored state completed.
    /// * `model_parameters` - The restored parameters.
    /// * `optimizer_parameters` - The restored optimizer state.
    ///
    /// # Returns
    /// An error if the restored buffers don't fit this state.
    pub fn restore(
        &mut self,
        epoch: usize,
        model_parameters: &[f32],
        optimizer_parameters: &[f32],
    ) -> Result<()> {
        if model_parameters.len() != self.model_parameters.len() {
            return Err(MlErr::SizeMismatch {
                a: "restored parameters",
                b: "model parameters",
                got: model_parameters.len(),
                expected: self.model_parameters.len(),
            }
            .into());
        }

        self.optimizer.load_state(optimizer_parameters)?;
        self.model_parameters.copy_from_slice(model_parameters);
        self.current_epoch = epoch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::arch::Classifier;

    use super::*;

    #[test]
    fn fresh_state_depends_only_on_the_seed() {
        let model = Classifier::new(4, 3);
        let sgd = || Sgd::new(model.size(), 0.1, 0.9, 0.0);

        let a = TrainingState::fresh(&model, sgd(), 42).unwrap();
        let b = TrainingState::fresh(&model, sgd(), 42).unwrap();
        let c = TrainingState::fresh(&model, sgd(), 43).unwrap();

        assert_eq!(a.model_parameters, b.model_parameters);
        assert_ne!(a.model_parameters, c.model_parameters);
        assert_eq!(a.current_epoch, 0);
    }

    #[test]
    fn restore_checks_sizes() {
        let model = Classifier::new(2, 2);
        let mut state = TrainingState::zeroed(&model, Sgd::new(6, 0.1, 0.9, 0.0)).unwrap();

        assert!(state.restore(3, &[1.0; 6], &[0.5; 6]).is_ok());
        assert_eq!(state.current_epoch, 3);
        assert_eq!(state.optimizer_parameters(), [0.5; 6]);

        assert!(state.restore(4, &[1.0; 5], &[0.5; 6]).is_err());
        assert!(TrainingState::zeroed(&model, Sgd::new(5, 0.1, 0.9, 0.0)).is_err());
    }
}
