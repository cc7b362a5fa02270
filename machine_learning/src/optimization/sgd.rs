use super::Optimizer;
use crate::{MlErr, Result};

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// Each update computes `v = momentum * v + (g + weight_decay * p)` and then `p -= lr * v`.
/// The velocity buffer is the whole optimizer state, it's what gets checkpointed and broadcast
/// together with the parameters.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer with zeroed velocity.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - The decay factor of the velocity.
    /// * `weight_decay` - The L2 penalty coefficient.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Returns the optimizer's state.
    pub fn state(&self) -> &[f32] {
        &self.velocity
    }

    /// Returns the optimizer's state mutably, to be overwritten in place by a broadcast.
    pub fn state_mut(&mut self) -> &mut [f32] {
        &mut self.velocity
    }

    /// Replaces the optimizer's state.
    ///
    /// # Arguments
    /// * `state` - A state previously taken from `Sgd::state`.
    ///
    /// # Returns
    /// An error if `state` was taken from an optimizer of a different size.
    pub fn load_state(&mut self, state: &[f32]) -> Result<()> {
        if state.len() != self.velocity.len() {
            return Err(MlErr::SizeMismatch {
                a: "optimizer state",
                b: "velocity",
                got: state.len(),
                expected: self.velocity.len(),
            });
        }

        self.velocity.copy_from_slice(state);
        Ok(())
    }
}

impl Optimizer for Sgd {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() || grad.len() != self.velocity.len() {
            return Err(MlErr::SizeMismatch {
                a: "gradient",
                b: "parameters",
                got: grad.len(),
                expected: params.len(),
            });
        }

        let lr = self.learning_rate;
        let mu = self.momentum;
        let wd = self.weight_decay;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + (g + wd * *p);
                *p -= lr * *v;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_accumulates_across_updates() {
        let mut sgd = Sgd::new(1, 0.5, 0.5, 0.0);
        let mut params = [1.0];

        sgd.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(sgd.state(), &[1.0]);
        assert_eq!(params, [0.5]);

        sgd.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(sgd.state(), &[1.5]);
        assert_eq!(params, [-0.25]);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut sgd = Sgd::new(1, 1.0, 0.0, 0.5);
        let mut params = [2.0];

        sgd.update_params(&[0.0], &mut params).unwrap();
        assert_eq!(params, [1.0]);
    }

    #[test]
    fn new_rates_apply_to_the_next_update() {
        let mut sgd = Sgd::new(1, 0.0, 0.0, 0.0);
        let mut params = [1.0];

        sgd.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(params, [1.0]);

        sgd.set_learning_rate(0.25);
        assert_eq!(sgd.learning_rate(), 0.25);

        sgd.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(params, [0.75]);
    }

    #[test]
    fn state_roundtrips_through_load() {
        let mut sgd = Sgd::new(2, 0.1, 0.9, 0.0);
        sgd.update_params(&[1.0, -1.0], &mut [0.0, 0.0]).unwrap();

        let mut other = Sgd::new(2, 0.1, 0.9, 0.0);
        other.load_state(sgd.state()).unwrap();
        assert_eq!(other.state(), sgd.state());

        assert!(other.load_state(&[0.0]).is_err());
    }
}
