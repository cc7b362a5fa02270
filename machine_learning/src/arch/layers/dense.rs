use ndarray::{linalg, prelude::*};

use crate::{MlErr, Result};

/// A fully connected layer without activation, `z = x * w + b`.
///
/// Its parameters are laid out as the row major `(fan_in, fan_out)` weights followed by the
/// `fan_out` biases.
#[derive(Clone)]
pub struct Dense {
    dim: (usize, usize),
    size: usize,

    // Forward metadata
    x: Array2<f32>,
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The `(fan_in, fan_out)` of the layer.
    ///
    /// # Returns
    /// A new `Dense` instance.
    pub fn new(dim: (usize, usize)) -> Self {
        let zeros = Array2::zeros((0, 0));

        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
            x: zeros.clone(),
            z: zeros,
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the `(fan_in, fan_out)` of this layer.
    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Returns the amount of parameters that are weights, the rest are biases.
    pub fn weights_len(&self) -> usize {
        self.size - self.dim.1
    }

    /// Computes the output of the layer, keeping the input around for `Dense::backward`.
    ///
    /// # Arguments
    /// * `params` - The layer's parameters.
    /// * `x` - The batch inputs, one example per row.
    ///
    /// # Returns
    /// The layer's output, or an error if either `params` or `x` don't fit this layer.
    pub fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<ArrayView2<'_, f32>> {
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                a: "inputs",
                b: "dense layer",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let shape = (x.nrows(), self.dim.1);

        if self.z.dim() != shape {
            self.z = Array2::zeros(shape);
        }

        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut self.z);
        self.z += &b;

        self.x = x.to_owned();
        Ok(self.z.view())
    }

    /// Writes the gradient of the layer's parameters given the delta of its output.
    ///
    /// # Arguments
    /// * `grad` - The gradient buffer, as long as the layer's parameters.
    /// * `d` - The derivative of the loss with respect to the last output.
    ///
    /// # Returns
    /// An error if `grad` or `d` don't match the last forward pass.
    pub fn backward(&self, grad: &mut [f32], d: ArrayView2<f32>) -> Result<()> {
        if d.dim() != self.z.dim() {
            return Err(MlErr::SizeMismatch {
                a: "output delta",
                b: "last forward pass",
                got: d.len(),
                expected: self.z.len(),
            });
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        Ok(())
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        self.check_len("gradient", grad.len())?;

        let (dw_raw, db_raw) = grad.split_at_mut(self.weights_len());
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        self.check_len("parameters", params.len())?;

        let (w_raw, b_raw) = params.split_at(self.weights_len());
        let weights = ArrayView2::from_shape(self.dim, w_raw)?;
        let biases = ArrayView1::from_shape(self.dim.1, b_raw)?;
        Ok((weights, biases))
    }

    fn check_len(&self, what: &'static str, len: usize) -> Result<()> {
        if len != self.size {
            return Err(MlErr::SizeMismatch {
                a: what,
                b: "dense layer",
                got: len,
                expected: self.size,
            });
        }

        Ok(())
    }
}
