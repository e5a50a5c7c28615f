//! # kiln
//!
//! A compiled-job tensor runtime with interchangeable acceleration
//! backends.
//!
//! A job is declared as an expression graph over typed, shaped
//! placeholders, compiled against an immutable per-job configuration that
//! selects exactly one execution strategy, and invoked with concrete
//! tensors. Three strategies ship in-process — a baseline interpreter, a
//! JIT instruction tape, and a fused inference engine — and the comparison
//! driver checks that they agree within bounded numeric tolerances.
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `kiln-core`  | Tensor, Shape, Layout, DType, Backend trait |
//! | `kiln-cpu`   | Reference CPU backend (rayon kernels) |
//! | `kiln-graph` | Expression graphs: builder, validation, shape inference |
//! | `kiln`       | Jobs, sessions, the three execution engines, comparison |
//!
//! ## Usage
//!
//! ```ignore
//! use kiln::prelude::*;
//!
//! let mut g = GraphBuilder::new();
//! let x = g.placeholder("x", (1, 10), DType::F32)?;
//! let y = g.placeholder("y", (1, 10), DType::F32)?;
//! let sum = g.add(x, y)?;
//! let out = g.add(sum, x)?;          // x + y + x
//! g.output("out", out)?;
//! let graph = g.finish()?;
//!
//! let mut session = Session::<CpuBackend>::new(CpuDevice);
//! let config = JobConfig::new().with_mode(ExecutionMode::Jit);
//! session.compile(JobBuilder::new("add", config, graph))?;
//!
//! let x = CpuTensor::ones((1, 10), DType::F32, &CpuDevice)?;
//! let batch = session.job("add")?.invoke(&[x.clone(), x])?;
//! let result = batch.primary()?;
//! ```

/// Re-export core types.
pub use kiln_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    DType, Error, Layout, Result, Shape, Tensor, WithDType,
};

/// Re-export the CPU backend.
pub use kiln_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export expression graphs.
pub use kiln_graph::{Graph, GraphBuilder, NodeId, OpKind, TensorType};

/// Per-job immutable configuration and execution mode selection.
pub mod config;

/// Job declaration, compilation, invocation, and output retrieval.
pub mod job;

/// Session: the registry of compiled jobs, explicitly resettable.
pub mod session;

/// The three execution engines (interpreter, JIT, inference engine).
pub mod exec;

/// Shared operator routines (layer-norm gradient).
pub mod ops;

/// Closeness checks and the cross-backend comparison driver.
pub mod compare;

pub use config::{ExecutionMode, JobConfig};
pub use job::{Job, JobBuilder, OutputBatch};
pub use session::Session;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::compare::{allclose, BackendComparison, DEFAULT_ATOL, DEFAULT_RTOL};
    pub use crate::config::{ExecutionMode, JobConfig};
    pub use crate::exec::{CompileStats, EnginePlan, EngineSummary, Interpreter, JitPlan};
    pub use crate::job::{Job, JobBuilder, OutputBatch};
    pub use crate::ops::layer_norm_grad;
    pub use crate::session::Session;
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, GraphBuilder, Shape, Tensor};
}
