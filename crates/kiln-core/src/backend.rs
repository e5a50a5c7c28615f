use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

// Backend — abstraction over compute devices
//
// Every storage target (the reference CPU backend, a future accelerator)
// implements this trait. A trait rather than a device enum keeps kiln-core
// closed while new backends live in their own crates with their own storage
// types, and lets the compiler monomorphize Tensor<B> per backend.
//
// All operations take storage plus a Layout (which encodes shape, strides,
// and broadcasting) and return fresh storage — no in-place mutation.

/// Identifies a compute device (e.g. "cpu").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// Human-readable device name.
    fn name(&self) -> String;
}

/// A buffer holding tensor elements on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// Element type of this storage.
    fn dtype(&self) -> DType;

    /// Number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Op category enums. One trait method per category keeps the Backend trait
// small; the enums double as the op vocabulary of compiled instruction tapes.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Square,
}

/// Reductions over a set of dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// The core interface every compute backend implements.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    // Creation

    /// Storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage filled with ones.
    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage filled with a constant.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage from a flat f64 slice, converted to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage with uniform random values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Storage with standard normal random values.
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Element-wise ops

    /// result[i] = op(lhs[i], rhs[i]); the layouts carry broadcasting and
    /// non-contiguous access.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// result[i] = op(input[i]).
    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    // Reductions

    /// Reduce along the given dimensions; empty `dims` reduces everything.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    // Data movement

    /// Dense row-major copy of the storage following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy the logical elements to a host Vec<f64>, in row-major order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;
}
