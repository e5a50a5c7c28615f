use std::fmt;

use kiln_core::backend::Backend;
use kiln_core::error::Result;
use kiln_core::tensor::Tensor;
use kiln_core::Error;
use kiln_graph::Graph;

use crate::config::{ExecutionMode, JobConfig};
use crate::exec::{CompileStats, EnginePlan, EngineSummary, Interpreter, JitPlan};

// Job — a named, compiled, invocable unit of computation
//
// A job is created by a JobBuilder from three ingredients: a name, an
// immutable JobConfig, and a Graph. Building compiles the graph for the
// configured execution mode; the returned Job owns its config copy, so the
// configuration a job runs under is exactly the one it was built with —
// there is no shared mutable config to race against a later declaration.
//
// Invocation takes concrete tensors positionally, in placeholder
// declaration order, checks them against the declared contracts, and
// returns an OutputBatch holding the materialized results.

/// Declares a job: name + config + graph, compiled by [`JobBuilder::build`].
#[derive(Debug, Clone)]
pub struct JobBuilder {
    name: String,
    config: JobConfig,
    graph: Graph,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>, config: JobConfig, graph: Graph) -> Self {
        JobBuilder {
            name: name.into(),
            config,
            graph,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> JobConfig {
        self.config
    }

    /// Compile the graph for the configured execution mode.
    pub fn build<B: Backend>(self, device: B::Device) -> Result<Job<B>> {
        let plan = match self.config.mode() {
            ExecutionMode::Baseline => {
                Plan::Interp(Interpreter::new(self.graph.clone(), device))
            }
            ExecutionMode::Jit => {
                Plan::Jit(JitPlan::compile(&self.name, &self.graph, device)?)
            }
            ExecutionMode::Accelerated => {
                Plan::Accel(EnginePlan::build(&self.name, &self.graph, device)?)
            }
        };
        Ok(Job {
            name: self.name,
            config: self.config,
            graph: self.graph,
            plan,
        })
    }
}

/// The compiled artifact backing a job.
enum Plan<B: Backend> {
    Interp(Interpreter<B>),
    Jit(JitPlan<B>),
    Accel(EnginePlan<B>),
}

/// A compiled, invocable job bound to one configuration snapshot.
pub struct Job<B: Backend> {
    name: String,
    config: JobConfig,
    graph: Graph,
    plan: Plan<B>,
}

impl<B: Backend> fmt::Debug for Job<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({}, mode={})", self.name, self.config.mode())
    }
}

impl<B: Backend> Job<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration snapshot this job was compiled under.
    pub fn config(&self) -> JobConfig {
        self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// JIT compilation statistics, when this job runs on the JIT.
    pub fn jit_stats(&self) -> Option<&CompileStats> {
        match &self.plan {
            Plan::Jit(plan) => Some(plan.stats()),
            _ => None,
        }
    }

    /// Engine fusion summary, when this job runs on the inference engine.
    pub fn engine_summary(&self) -> Option<EngineSummary> {
        match &self.plan {
            Plan::Accel(plan) => Some(plan.summary()),
            _ => None,
        }
    }

    /// Human-readable rendering of the compiled plan.
    pub fn dump(&self) -> String {
        match &self.plan {
            Plan::Interp(interp) => format!("Interpreted: {}\n{}", self.name, interp.graph()),
            Plan::Jit(plan) => plan.dump(),
            Plan::Accel(plan) => format!("Inference engine: {} ({})", self.name, plan.summary()),
        }
    }

    /// Run the job on concrete tensors, positionally matching the graph's
    /// placeholder order. Inputs are checked against the declared contracts
    /// before anything executes.
    pub fn invoke(&self, inputs: &[Tensor<B>]) -> Result<OutputBatch<B>> {
        let placeholders = self.graph.placeholders();
        if inputs.len() != placeholders.len() {
            return Err(Error::InputArityMismatch {
                job: self.name.clone(),
                expected: placeholders.len(),
                got: inputs.len(),
            });
        }
        for (spec, tensor) in placeholders.iter().zip(inputs) {
            if tensor.shape() != &spec.ty.shape {
                return Err(Error::PlaceholderViolation {
                    placeholder: spec.name.clone(),
                    reason: format!(
                        "declared shape {}, got {}",
                        spec.ty.shape,
                        tensor.shape()
                    ),
                });
            }
            if tensor.dtype() != spec.ty.dtype {
                return Err(Error::PlaceholderViolation {
                    placeholder: spec.name.clone(),
                    reason: format!("declared dtype {}, got {}", spec.ty.dtype, tensor.dtype()),
                });
            }
        }

        let outputs = match &self.plan {
            Plan::Interp(interp) => interp.run(inputs)?,
            Plan::Jit(plan) => plan.run(inputs)?,
            Plan::Accel(plan) => plan.run(inputs)?,
        };
        Ok(OutputBatch { outputs })
    }
}

/// The materialized results of one job invocation.
///
/// Execution is synchronous and side-effect-free, so the batch is complete
/// the moment `invoke` returns; retrieval never blocks and never fails for
/// an output the graph declares.
#[derive(Debug)]
pub struct OutputBatch<B: Backend> {
    /// `(output name, tensor)` in graph output order.
    outputs: Vec<(String, Tensor<B>)>,
}

impl<B: Backend> OutputBatch<B> {
    /// The first declared output — the common single-output case.
    pub fn primary(&self) -> Result<&Tensor<B>> {
        self.outputs
            .first()
            .map(|(_, t)| t)
            .ok_or_else(|| Error::msg("job produced no outputs"))
    }

    /// An output by name.
    pub fn get(&self, name: &str) -> Result<&Tensor<B>> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
            .ok_or_else(|| Error::UnknownOutput(name.to_string()))
    }

    /// All outputs, in graph output order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<B>)> {
        self.outputs.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
