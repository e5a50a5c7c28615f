use std::sync::Arc;

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::bail;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor — an n-dimensional array on a backend
//
// Tensor<B> is the value type that flows through compiled jobs: inputs,
// intermediates, and outputs are all tensors. It is a cheap-clone handle —
// the inner struct is behind an Arc, so cloning copies a pointer and views
// (transpose, reshape) share the same storage with a different Layout.
//
// Storage is immutable once created: every operation allocates fresh
// storage for its result. That keeps job invocation side-effect-free, which
// is what makes repeated invocation of a compiled job reproducible.

struct TensorInner<B: Backend> {
    /// Raw elements on the backend's device. Shared between views.
    storage: Arc<B::Storage>,
    /// Shape + strides + offset into the storage.
    layout: Layout,
    dtype: DType,
    device: B::Device,
}

/// An n-dimensional array of numbers on a specific backend.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

// Manual Clone: Arc::clone is cheap, no bound on B needed.
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={:?})",
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    fn from_storage(storage: B::Storage, layout: Layout, dtype: DType, device: B::Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(storage),
                layout,
                dtype,
                device,
            }),
        }
    }

    /// A view sharing this tensor's storage under a different layout.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        }
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// Shortcut for `shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    // Creation

    /// Tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Tensor from a flat f64 slice, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Tensor with uniform random values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Tensor with standard normal random values.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    // Views

    /// Swap two dimensions (no data copy).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.inner.layout.transpose(dim0, dim1)?;
        Ok(self.view_with_layout(layout))
    }

    /// Transpose a 2-D tensor (shorthand for `transpose(0, 1)`).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Reshape to a new shape with the same element count.
    ///
    /// Non-contiguous tensors are made contiguous first; contiguous ones get
    /// a free view.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if self.elem_count() != new_shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        let base = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        Ok(base.view_with_layout(Layout::contiguous(new_shape)))
    }

    /// Dense row-major copy; a cheap clone if already contiguous.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = B::to_contiguous(&self.inner.storage, &self.inner.layout)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    // Arithmetic

    /// Element-wise addition with broadcasting.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division with broadcasting.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let storage = B::binary_op(
            op,
            &self.inner.storage,
            &self.inner.layout,
            &rhs.inner.storage,
            &rhs.inner.layout,
        )?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    /// Element-wise square.
    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = B::unary_op(op, &self.inner.storage, &self.inner.layout)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    // Reductions

    /// Sum over the given dimensions.
    pub fn sum(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, dims, keep_dim)
    }

    /// Mean over the given dimensions.
    pub fn mean(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, dims, keep_dim)
    }

    /// Sum of every element, as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    /// Mean of every element, as a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        let rank = self.rank();
        for &d in dims {
            if d >= rank {
                return Err(Error::DimOutOfRange { dim: d, rank });
            }
        }
        let storage = B::reduce_op(op, &self.inner.storage, &self.inner.layout, dims, keep_dim)?;
        let result_shape = reduced_shape(self.shape(), dims, keep_dim);
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    // Host readback

    /// Copy the logical elements to the host as f64, row-major.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(&self.inner.storage, &self.inner.layout)
    }

    /// Read a single-element tensor as an f64 scalar.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            bail!(
                "to_scalar_f64: tensor has {} elements, expected 1",
                self.elem_count()
            );
        }
        Ok(self.to_f64_vec()?[0])
    }
}

/// The shape left after reducing `dims`. Empty `dims` reduces everything.
pub fn reduced_shape(shape: &Shape, dims: &[usize], keep_dim: bool) -> Shape {
    if dims.is_empty() {
        return if keep_dim {
            Shape::new(vec![1; shape.rank()])
        } else {
            Shape::new(vec![])
        };
    }
    let mut out = Vec::with_capacity(shape.rank());
    for (i, &d) in shape.dims().iter().enumerate() {
        if dims.contains(&i) {
            if keep_dim {
                out.push(1);
            }
        } else {
            out.push(d);
        }
    }
    Shape::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_shape_drops_or_keeps_dims() {
        let s = Shape::from((2, 10, 2));
        assert_eq!(reduced_shape(&s, &[2], true).dims(), &[2, 10, 1]);
        assert_eq!(reduced_shape(&s, &[2], false).dims(), &[2, 10]);
        assert_eq!(reduced_shape(&s, &[1, 2], false).dims(), &[2]);
        assert_eq!(reduced_shape(&s, &[], false).rank(), 0);
        assert_eq!(reduced_shape(&s, &[], true).dims(), &[1, 1, 1]);
    }
}
