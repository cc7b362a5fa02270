use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::Result;

/// Fills `weights` sampling from a normal distribution.
///
/// # Arguments
/// * `rng` - A random number generator.
/// * `weights` - The buffer to fill.
/// * `mean` - The mean of the distribution.
/// * `std_dev` - The standard deviation of the distribution.
///
/// # Returns
/// An error if `std_dev` is not a valid standard deviation.
pub fn normal<R: Rng>(rng: &mut R, weights: &mut [f32], mean: f32, std_dev: f32) -> Result<()> {
    let distribution = Normal::new(mean, std_dev)?;
    weights
        .iter_mut()
        .for_each(|w| *w = distribution.sample(rng));

    Ok(())
}

/// Fills `weights` using Kaiming normal initialization.
///
/// # Arguments
/// * `rng` - A random number generator.
/// * `weights` - The buffer to fill.
/// * `fan_in` - The number of input units in the weight tensor.
///
/// # Returns
/// An error if the calculated standard deviation is not finite (Nan or infinite).
pub fn kaiming<R: Rng>(rng: &mut R, weights: &mut [f32], fan_in: usize) -> Result<()> {
    let std_dev = (2. / fan_in as f32).sqrt();
    normal(rng, weights, 0., std_dev)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn same_seed_same_weights() {
        let mut a = [0.0; 64];
        let mut b = [0.0; 64];

        kaiming(&mut StdRng::seed_from_u64(42), &mut a, 8).unwrap();
        kaiming(&mut StdRng::seed_from_u64(42), &mut b, 8).unwrap();

        assert_eq!(a, b);
        assert!(a.iter().any(|&w| w != 0.0));
    }

    #[test]
    fn nan_std_dev_is_rejected() {
        let mut w = [0.0; 4];
        assert!(normal(&mut StdRng::seed_from_u64(0), &mut w, 0.0, f32::NAN).is_err());
    }
}
