// Shared operator routines
//
// Tensor-level implementations of the composite operators that appear as
// single graph nodes. The interpreter and the JIT both call these, which is
// what keeps their numerics identical: the only thing an engine changes is
// scheduling, never the math.

use kiln_core::backend::Backend;
use kiln_core::error::Result;
use kiln_core::tensor::Tensor;
use kiln_core::{bail, Error};

/// Gradient of layer normalization w.r.t. its input.
///
/// `dy` and `x` share one shape; `mean` and `inv_variance` carry the
/// statistics shape `x.shape[..begin_norm_axis]`, one entry per
/// normalization row. With `x_hat = (x - mean) * inv_variance` and means
/// taken over the trailing (normalized) axes:
///
///   dx = inv_variance * (dy - mean(dy) - x_hat * mean(dy * x_hat))
///
/// Internally everything is flattened to `[rows, m]` so the trailing-axis
/// means become a single keep-dim reduction and the statistics broadcast
/// back as `[rows, 1]`.
pub fn layer_norm_grad<B: Backend>(
    dy: &Tensor<B>,
    x: &Tensor<B>,
    mean: &Tensor<B>,
    inv_variance: &Tensor<B>,
    begin_norm_axis: usize,
) -> Result<Tensor<B>> {
    if dy.shape() != x.shape() {
        return Err(Error::ShapeMismatch {
            expected: x.shape().clone(),
            got: dy.shape().clone(),
        });
    }
    let rank = x.rank();
    if begin_norm_axis == 0 || begin_norm_axis >= rank {
        bail!(
            "layer_norm_grad: begin_norm_axis {} out of range for rank {}",
            begin_norm_axis,
            rank
        );
    }
    let rows = x.shape().leading(begin_norm_axis).elem_count();
    let m = x.elem_count() / rows;
    if mean.elem_count() != rows || inv_variance.elem_count() != rows {
        bail!(
            "layer_norm_grad: statistics carry {} entries, expected {}",
            mean.elem_count().max(inv_variance.elem_count()),
            rows
        );
    }

    let dy2 = dy.reshape((rows, m))?;
    let x2 = x.reshape((rows, m))?;
    let mean2 = mean.reshape((rows, 1))?;
    let inv2 = inv_variance.reshape((rows, 1))?;

    let x_hat = x2.sub(&mean2)?.mul(&inv2)?;
    let dy_mean = dy2.mean(&[1], true)?;
    let proj = dy2.mul(&x_hat)?.mean(&[1], true)?;

    let dx = dy2.sub(&dy_mean)?.sub(&x_hat.mul(&proj)?)?.mul(&inv2)?;
    dx.reshape(x.shape().clone())
}
