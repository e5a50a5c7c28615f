use std::fmt;

use kiln_core::DType;

// JobConfig — per-job, immutable execution configuration
//
// A config is a plain value. It is constructed fresh for every job, moved
// into the builder, and captured by the compiled job; nothing can mutate it
// after the job exists. Backend selection is an enum, so a job is bound to
// exactly one execution strategy by construction — there is no flag pair
// whose combination has to be policed at runtime.

/// Which execution strategy a job compiles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// Interpret the graph node by node. The reference semantics.
    #[default]
    Baseline,
    /// Lower the graph to a pre-compiled instruction tape.
    Jit,
    /// Lower the graph to a fused inference engine plan. Supports only the
    /// inference op set; unsupported ops fail at build time.
    Accelerated,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Baseline => "baseline",
            ExecutionMode::Jit => "jit",
            ExecutionMode::Accelerated => "accelerated",
        };
        write!(f, "{}", s)
    }
}

/// Immutable configuration captured by a job at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobConfig {
    mode: ExecutionMode,
    default_dtype: DType,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            mode: ExecutionMode::Baseline,
            default_dtype: DType::F32,
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the execution strategy.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Default dtype for values whose graph does not pin one.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.default_dtype = dtype;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn default_dtype(&self) -> DType {
        self.default_dtype
    }
}
