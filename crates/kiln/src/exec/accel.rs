// Inference Engine — the accelerated execution backend
//
// Models an ahead-of-time inference compiler: a deliberately restricted
// engine that trades generality for fused execution. At build time it
//
//   1. checks every op against its support table — anything outside the
//      inference op set (reductions, layer_norm_grad) is rejected with
//      Error::UnsupportedOp rather than silently falling back;
//   2. fuses chains of elementwise ops into single layers. A value is
//      materialized as a tensor only if it is a placeholder, a graph
//      output, feeds more than one consumer, or crosses a reshape;
//      everything in between becomes a register program evaluated in one
//      pass over the output elements, with no intermediate tensors.
//
// The layer count before/after fusion is observable via `summary()`, the
// analogue of an engine inspector.

use std::fmt;

use kiln_core::backend::{Backend, BinaryOp, UnaryOp};
use kiln_core::error::Result;
use kiln_core::tensor::Tensor;
use kiln_core::{DType, Error, Layout, Shape};
use kiln_graph::{Graph, NodeId, OpKind};

/// Where a fused layer reads one of its operands from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueRef {
    /// The caller's n-th positional input.
    Input(usize),
    /// The output of an earlier layer, keyed by source node index.
    Layer(usize),
}

/// One step of a fused register program. Registers are step indices: step k
/// may read any register j < k.
#[derive(Debug, Clone)]
enum Step {
    /// Read operand `operand` of the layer at the current element.
    Load { operand: usize },
    Unary { op: UnaryOp, src: usize },
    Binary { op: BinaryOp, lhs: usize, rhs: usize },
}

/// What a layer does when executed.
#[derive(Debug, Clone)]
enum LayerKind {
    /// Evaluate a register program elementwise over the output shape.
    Fused { steps: Vec<Step>, fused_ops: usize },
    /// A free relabeling of the operand's shape.
    Reshape { shape: Shape },
}

/// One executable layer of the engine plan.
#[derive(Debug, Clone)]
struct Layer {
    /// Source node this layer materializes.
    node: usize,
    operands: Vec<ValueRef>,
    kind: LayerKind,
    out_shape: Shape,
    out_dtype: DType,
}

/// Post-build description of an engine plan: how much the builder fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSummary {
    /// Ops in the source graph, placeholders excluded.
    pub source_ops: usize,
    /// Layers actually executed.
    pub layers: usize,
    /// Ops folded into a fused neighbor instead of materializing.
    pub fused_away: usize,
}

impl fmt::Display for EngineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} source ops -> {} layers ({} fused away)",
            self.source_ops, self.layers, self.fused_away
        )
    }
}

/// A built inference engine for one graph.
pub struct EnginePlan<B: Backend> {
    name: String,
    layers: Vec<Layer>,
    /// `(output name, source node index)` in graph output order.
    output_bindings: Vec<(String, usize)>,
    summary: EngineSummary,
    device: B::Device,
}

impl<B: Backend> fmt::Debug for EnginePlan<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnginePlan({}, {})", self.name, self.summary)
    }
}

impl<B: Backend> EnginePlan<B> {
    /// Build an engine for `graph`, rejecting unsupported ops.
    pub fn build(name: &str, graph: &Graph, device: B::Device) -> Result<Self> {
        // Support check first: the whole graph is validated before any
        // lowering, so a build error always names the offending op.
        for node in graph.nodes() {
            match &node.op {
                OpKind::Placeholder | OpKind::Reshape { .. } => {}
                op if op.is_elementwise() => {}
                op => {
                    return Err(Error::UnsupportedOp {
                        engine: "inference".to_string(),
                        op: op.name().to_string(),
                    })
                }
            }
        }

        let consumers = graph.consumer_counts();
        let nodes = graph.nodes();

        // A node materializes if anything other than a single fusable
        // consumer needs it as a real tensor.
        let mut materialized = vec![false; nodes.len()];
        for node in nodes {
            let idx = node.id.index();
            materialized[idx] = match &node.op {
                OpKind::Placeholder => true,
                OpKind::Reshape { .. } => true,
                _ => consumers[idx] != 1,
            };
            // A reshape consumer needs its operand materialized too: the
            // relabeling applies to a tensor, not a register.
            if let OpKind::Reshape { .. } = node.op {
                if let Some(input) = node.inputs.first() {
                    materialized[input.index()] = true;
                }
            }
        }
        for out in graph.outputs() {
            materialized[out.node_id.index()] = true;
        }

        let input_position = |id: NodeId| -> Result<usize> {
            graph
                .placeholders()
                .iter()
                .position(|p| p.node_id == id)
                .ok_or_else(|| Error::msg("placeholder node missing from declaration list"))
        };

        // Emit one layer per materialized non-placeholder node, inlining
        // every virtual (non-materialized) node of its operand tree.
        let mut layers = Vec::new();
        let mut fused_away_total = 0usize;
        for node in nodes {
            let idx = node.id.index();
            if !materialized[idx] {
                continue;
            }
            match &node.op {
                OpKind::Placeholder => {}
                OpKind::Reshape { shape } => {
                    let src = node.inputs[0];
                    let operand = if let OpKind::Placeholder = graph.node(src).op {
                        ValueRef::Input(input_position(src)?)
                    } else {
                        ValueRef::Layer(src.index())
                    };
                    layers.push(Layer {
                        node: idx,
                        operands: vec![operand],
                        kind: LayerKind::Reshape {
                            shape: shape.clone(),
                        },
                        out_shape: node.ty.shape.clone(),
                        out_dtype: node.ty.dtype,
                    });
                }
                _ => {
                    let mut operands = Vec::new();
                    let mut steps = Vec::new();
                    let mut fused_ops = 0usize;
                    emit_steps(
                        graph,
                        node.id,
                        &materialized,
                        &input_position,
                        &mut operands,
                        &mut steps,
                        &mut fused_ops,
                        true,
                    )?;
                    // The root op itself is a layer, not a fusion win.
                    fused_away_total += fused_ops.saturating_sub(1);
                    layers.push(Layer {
                        node: idx,
                        operands,
                        kind: LayerKind::Fused { steps, fused_ops },
                        out_shape: node.ty.shape.clone(),
                        out_dtype: node.ty.dtype,
                    });
                }
            }
        }

        // An output bound straight to a placeholder still needs a layer:
        // the engine only hands back values it computed.
        for out in graph.outputs() {
            let node = graph.node(out.node_id);
            if let OpKind::Placeholder = node.op {
                layers.push(Layer {
                    node: out.node_id.index(),
                    operands: vec![ValueRef::Input(input_position(out.node_id)?)],
                    kind: LayerKind::Fused {
                        steps: vec![Step::Load { operand: 0 }],
                        fused_ops: 0,
                    },
                    out_shape: node.ty.shape.clone(),
                    out_dtype: node.ty.dtype,
                });
            }
        }

        let output_bindings = graph
            .outputs()
            .iter()
            .map(|o| (o.name.clone(), o.node_id.index()))
            .collect();

        let source_ops = nodes
            .iter()
            .filter(|n| !matches!(n.op, OpKind::Placeholder))
            .count();
        let summary = EngineSummary {
            source_ops,
            layers: layers.len(),
            fused_away: fused_away_total,
        };

        Ok(EnginePlan {
            name: name.to_string(),
            layers,
            output_bindings,
            summary,
            device,
        })
    }

    pub fn summary(&self) -> EngineSummary {
        self.summary
    }

    /// Execute the plan with positional inputs.
    pub fn run(&self, inputs: &[Tensor<B>]) -> Result<Vec<(String, Tensor<B>)>> {
        // Materialized values, indexed by source node.
        let mut values: Vec<Option<Tensor<B>>> = Vec::new();
        let max_node = self
            .layers
            .iter()
            .map(|l| l.node)
            .chain(self.output_bindings.iter().map(|(_, n)| *n))
            .max()
            .unwrap_or(0);
        values.resize(max_node + 1, None);

        for layer in &self.layers {
            let resolve = |r: &ValueRef| -> Result<Tensor<B>> {
                match r {
                    ValueRef::Input(pos) => inputs
                        .get(*pos)
                        .cloned()
                        .ok_or_else(|| Error::msg(format!("missing positional input {}", pos))),
                    ValueRef::Layer(node) => values
                        .get(*node)
                        .and_then(|v| v.clone())
                        .ok_or_else(|| Error::msg(format!("layer value %{} not computed", node))),
                }
            };

            let result = match &layer.kind {
                LayerKind::Reshape { shape } => resolve(&layer.operands[0])?.reshape(shape.clone())?,
                LayerKind::Fused { steps, .. } => {
                    let operand_tensors: Vec<Tensor<B>> = layer
                        .operands
                        .iter()
                        .map(resolve)
                        .collect::<Result<Vec<_>>>()?;
                    run_fused_layer(
                        steps,
                        &operand_tensors,
                        &layer.out_shape,
                        layer.out_dtype,
                        &self.device,
                    )?
                }
            };
            values[layer.node] = Some(result);
        }

        let mut outputs = Vec::with_capacity(self.output_bindings.len());
        for (name, node) in &self.output_bindings {
            // A graph output can also be a bare placeholder.
            let tensor = match &values[*node] {
                Some(t) => t.clone(),
                None => {
                    return Err(Error::UnknownOutput(name.clone()));
                }
            };
            outputs.push((name.clone(), tensor));
        }
        Ok(outputs)
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// Recursively inline the expression tree under `id` into a register
/// program. Materialized operands become Load steps; virtual elementwise
/// nodes are expanded in place. Returns the register holding `id`'s value.
#[allow(clippy::too_many_arguments)]
fn emit_steps<F>(
    graph: &Graph,
    id: NodeId,
    materialized: &[bool],
    input_position: &F,
    operands: &mut Vec<ValueRef>,
    steps: &mut Vec<Step>,
    fused_ops: &mut usize,
    is_root: bool,
) -> Result<usize>
where
    F: Fn(NodeId) -> Result<usize>,
{
    let node = graph.node(id);

    // Everything below the root that is materialized is a layer boundary.
    if !is_root && materialized[id.index()] {
        let value_ref = if let OpKind::Placeholder = node.op {
            ValueRef::Input(input_position(id)?)
        } else {
            ValueRef::Layer(id.index())
        };
        let operand = match operands.iter().position(|r| *r == value_ref) {
            Some(pos) => pos,
            None => {
                operands.push(value_ref);
                operands.len() - 1
            }
        };
        steps.push(Step::Load { operand });
        return Ok(steps.len() - 1);
    }

    *fused_ops += 1;
    match &node.op {
        OpKind::Neg | OpKind::Sqrt | OpKind::Square => {
            let src = emit_steps(
                graph,
                node.inputs[0],
                materialized,
                input_position,
                operands,
                steps,
                fused_ops,
                false,
            )?;
            let op = match node.op {
                OpKind::Neg => UnaryOp::Neg,
                OpKind::Sqrt => UnaryOp::Sqrt,
                _ => UnaryOp::Square,
            };
            steps.push(Step::Unary { op, src });
            Ok(steps.len() - 1)
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let lhs = emit_steps(
                graph,
                node.inputs[0],
                materialized,
                input_position,
                operands,
                steps,
                fused_ops,
                false,
            )?;
            let rhs = emit_steps(
                graph,
                node.inputs[1],
                materialized,
                input_position,
                operands,
                steps,
                fused_ops,
                false,
            )?;
            let op = match node.op {
                OpKind::Add => BinaryOp::Add,
                OpKind::Sub => BinaryOp::Sub,
                OpKind::Mul => BinaryOp::Mul,
                _ => BinaryOp::Div,
            };
            steps.push(Step::Binary { op, lhs, rhs });
            Ok(steps.len() - 1)
        }
        op => Err(Error::UnsupportedOp {
            engine: "inference".to_string(),
            op: op.name().to_string(),
        }),
    }
}

/// Evaluate a register program in one pass over the output elements.
fn run_fused_layer<B: Backend>(
    steps: &[Step],
    operands: &[Tensor<B>],
    out_shape: &Shape,
    out_dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let n = out_shape.elem_count();

    // Stage each operand densely and precompute its broadcast index walk.
    let mut buffers = Vec::with_capacity(operands.len());
    let mut indices = Vec::with_capacity(operands.len());
    for t in operands {
        buffers.push(t.to_f64_vec()?);
        let walk: Vec<usize> = Layout::broadcast_to(t.shape(), out_shape)
            .strided_indices()
            .collect();
        indices.push(walk);
    }

    let mut out = Vec::with_capacity(n);
    let mut regs = vec![0.0f64; steps.len()];
    for i in 0..n {
        for (k, step) in steps.iter().enumerate() {
            regs[k] = match step {
                Step::Load { operand } => buffers[*operand][indices[*operand][i]],
                Step::Unary { op, src } => {
                    let v = regs[*src];
                    match op {
                        UnaryOp::Neg => -v,
                        UnaryOp::Sqrt => v.sqrt(),
                        UnaryOp::Square => v * v,
                    }
                }
                Step::Binary { op, lhs, rhs } => {
                    let (a, b) = (regs[*lhs], regs[*rhs]);
                    match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                    }
                }
            };
        }
        out.push(regs[steps.len() - 1]);
    }

    Tensor::<B>::from_f64_slice(&out, out_shape.clone(), out_dtype, device)
}
