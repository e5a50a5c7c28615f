// CPU Backend — the reference compute backend
//
// This crate implements the kiln Backend trait on host memory. It is the
// backend every execution engine is checked against, so the priorities are,
// in order: correctness on arbitrary layouts (views, broadcasts), then
// simplicity, then speed.
//
// ARCHITECTURE:
// - CpuDevice is a unit handle; there is only one host.
// - CpuStorage is an enum over a plain Vec per dtype.
// - Kernels stage operands through f64: every supported dtype converts to
//   f64 exactly, and converting back rounds once on store (the same
//   promote-compute-round scheme the half-precision types use everywhere).
// - Elementwise kernels parallelize with rayon once the output is large
//   enough to amortize the fork.
//
// USAGE:
//   let x = CpuTensor::rand((2, 10, 2), DType::F32, &CpuDevice)?;
//   let y = x.add(&x)?;

use std::fmt;

use half::{bf16, f16};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use kiln_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use kiln_core::tensor::reduced_shape;
use kiln_core::{DType, Error, Layout, Result, Shape, Tensor, WithDType};

/// Minimum output size before elementwise kernels fan out to rayon.
const PAR_THRESHOLD: usize = 4096;

// CpuDevice

/// The host device. Unit-like: all CPU tensors share one address space.
#[derive(Clone, Copy, Default)]
pub struct CpuDevice;

impl fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuDevice")
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage

/// Host storage: one Vec per supported dtype.
#[derive(Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

/// Build storage of the requested dtype from f64 values.
fn collect_storage(dtype: DType, values: impl Iterator<Item = f64>) -> CpuStorage {
    match dtype {
        DType::F16 => CpuStorage::F16(values.map(f16::from_f64).collect()),
        DType::BF16 => CpuStorage::BF16(values.map(bf16::from_f64).collect()),
        DType::F32 => CpuStorage::F32(values.map(|v| v as f32).collect()),
        DType::F64 => CpuStorage::F64(values.collect()),
    }
}

/// Read the logical elements of `storage` under `layout` as f64, row-major.
fn gather_f64(storage: &CpuStorage, layout: &Layout) -> Vec<f64> {
    fn walk<T: WithDType>(data: &[T], layout: &Layout) -> Vec<f64> {
        layout
            .strided_indices()
            .map(|i| data[i].to_f64())
            .collect()
    }
    match storage {
        CpuStorage::F16(v) => walk(v, layout),
        CpuStorage::BF16(v) => walk(v, layout),
        CpuStorage::F32(v) => walk(v, layout),
        CpuStorage::F64(v) => walk(v, layout),
    }
}

// CpuBackend

/// The reference CPU backend.
#[derive(Clone, Debug)]
pub struct CpuBackend;

/// Convenience alias: a tensor on the CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(collect_storage(dtype, std::iter::repeat(0.0).take(n)))
    }

    fn ones(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(collect_storage(dtype, std::iter::repeat(1.0).take(n)))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(collect_storage(dtype, std::iter::repeat(val).take(n)))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(collect_storage(dtype, data.iter().copied()))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let n = shape.elem_count();
        Ok(collect_storage(dtype, (0..n).map(|_| rng.gen::<f64>())))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let n = shape.elem_count();
        Ok(collect_storage(
            dtype,
            (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)),
        ))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        if lhs.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            });
        }
        let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;

        // Stage both operands densely, then read them through broadcast
        // layouts. This handles transposed views and stride-0 repeats with
        // one code path.
        let a = gather_f64(lhs, lhs_layout);
        let b = gather_f64(rhs, rhs_layout);
        let la = Layout::broadcast_to(lhs_layout.shape(), &out_shape);
        let lb = Layout::broadcast_to(rhs_layout.shape(), &out_shape);

        let f = binary_fn(op);
        let n = out_shape.elem_count();
        let out: Vec<f64> = if n >= PAR_THRESHOLD {
            let ia: Vec<usize> = la.strided_indices().collect();
            let ib: Vec<usize> = lb.strided_indices().collect();
            (0..n).into_par_iter().map(|i| f(a[ia[i]], b[ib[i]])).collect()
        } else {
            la.strided_indices()
                .zip(lb.strided_indices())
                .map(|(i, j)| f(a[i], b[j]))
                .collect()
        };
        Ok(collect_storage(lhs.dtype(), out.into_iter()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = gather_f64(input, layout);
        let f = unary_fn(op);
        let out: Vec<f64> = if data.len() >= PAR_THRESHOLD {
            data.into_par_iter().map(f).collect()
        } else {
            data.into_iter().map(f).collect()
        };
        Ok(collect_storage(input.dtype(), out.into_iter()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<CpuStorage> {
        let shape = layout.shape();
        let _ = keep_dim; // element count is the same either way

        // Each input element lands in one output slot. Reading the keep-dim
        // output shape broadcast back over the input shape yields exactly
        // that slot sequence, in input logical order.
        let out_keep = reduced_shape(shape, dims, true);
        let slots = Layout::broadcast_to(&out_keep, shape);

        let data = gather_f64(input, layout);
        let mut acc = vec![0.0f64; out_keep.elem_count()];
        for (val, slot) in data.iter().zip(slots.strided_indices()) {
            acc[slot] += val;
        }

        if op == ReduceOp::Mean {
            let group = (shape.elem_count() / out_keep.elem_count()) as f64;
            for v in &mut acc {
                *v /= group;
            }
        }
        Ok(collect_storage(input.dtype(), acc.into_iter()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        fn walk<T: WithDType>(data: &[T], layout: &Layout) -> Vec<T> {
            layout.strided_indices().map(|i| data[i]).collect()
        }
        Ok(match input {
            CpuStorage::F16(v) => CpuStorage::F16(walk(v, layout)),
            CpuStorage::BF16(v) => CpuStorage::BF16(walk(v, layout)),
            CpuStorage::F32(v) => CpuStorage::F32(walk(v, layout)),
            CpuStorage::F64(v) => CpuStorage::F64(walk(v, layout)),
        })
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(gather_f64(input, layout))
    }
}

fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
    }
}

fn unary_fn(op: UnaryOp) -> fn(f64) -> f64 {
    match op {
        UnaryOp::Neg => |v| -v,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Square => |v| v * v,
    }
}
