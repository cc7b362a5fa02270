use crate::Result;

pub trait Optimizer {
    /// Applies one update to `params` given their gradient.
    ///
    /// # Returns
    /// An error if `grad` and `params` differ in length.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}
