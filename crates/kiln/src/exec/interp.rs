// Interpreter — the baseline execution engine
//
// Walks the graph in topological order, dispatching each node to the
// corresponding tensor operation and keeping every intermediate alive in a
// per-invocation value table. No lowering, no reuse, no fusion: this is the
// reference the other engines are checked against.

use kiln_core::backend::Backend;
use kiln_core::error::Result;
use kiln_core::tensor::Tensor;
use kiln_core::Error;
use kiln_graph::{Graph, Node, OpKind};

use crate::ops;

/// Interprets a graph directly. One instance per compiled job.
#[derive(Debug)]
pub struct Interpreter<B: Backend> {
    graph: Graph,
    device: B::Device,
}

impl<B: Backend> Interpreter<B> {
    pub fn new(graph: Graph, device: B::Device) -> Self {
        Interpreter { graph, device }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Execute with positional inputs (placeholder declaration order).
    /// Returns `(output name, tensor)` pairs in graph output order.
    pub fn run(&self, inputs: &[Tensor<B>]) -> Result<Vec<(String, Tensor<B>)>> {
        let mut values: Vec<Option<Tensor<B>>> = vec![None; self.graph.nodes().len()];

        for id in self.graph.topo_order() {
            let node = self.graph.node(id);
            let result = self.execute_node(node, &values, inputs)?;
            values[id.index()] = Some(result);
        }

        let mut outputs = Vec::with_capacity(self.graph.outputs().len());
        for output in self.graph.outputs() {
            let tensor = values[output.node_id.index()]
                .clone()
                .ok_or_else(|| Error::UnknownOutput(output.name.clone()))?;
            outputs.push((output.name.clone(), tensor));
        }
        Ok(outputs)
    }

    fn execute_node(
        &self,
        node: &Node,
        values: &[Option<Tensor<B>>],
        inputs: &[Tensor<B>],
    ) -> Result<Tensor<B>> {
        let operand = |idx: usize| require_operand(node, values, idx);

        match &node.op {
            OpKind::Placeholder => {
                let pos = self
                    .graph
                    .placeholders()
                    .iter()
                    .position(|p| p.node_id == node.id)
                    .ok_or_else(|| Error::msg("placeholder node missing from declaration list"))?;
                Ok(inputs[pos].clone())
            }

            OpKind::Add => operand(0)?.add(operand(1)?),
            OpKind::Sub => operand(0)?.sub(operand(1)?),
            OpKind::Mul => operand(0)?.mul(operand(1)?),
            OpKind::Div => operand(0)?.div(operand(1)?),

            OpKind::Neg => operand(0)?.neg(),
            OpKind::Sqrt => operand(0)?.sqrt(),
            OpKind::Square => operand(0)?.square(),

            OpKind::Sum { dims, keep_dim } => operand(0)?.sum(dims, *keep_dim),
            OpKind::Mean { dims, keep_dim } => operand(0)?.mean(dims, *keep_dim),

            OpKind::Reshape { shape } => operand(0)?.reshape(shape.clone()),

            OpKind::LayerNormGrad { begin_norm_axis } => ops::layer_norm_grad(
                operand(0)?,
                operand(1)?,
                operand(2)?,
                operand(3)?,
                *begin_norm_axis,
            ),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// Fetch a node's `idx`-th operand from the value table.
fn require_operand<'a, B: Backend>(
    node: &Node,
    values: &'a [Option<Tensor<B>>],
    idx: usize,
) -> Result<&'a Tensor<B>> {
    let id = node.inputs.get(idx).ok_or_else(|| {
        Error::msg(format!(
            "{} node has {} operands, needs index {}",
            node.op.name(),
            node.inputs.len(),
            idx
        ))
    })?;
    values[id.index()]
        .as_ref()
        .ok_or_else(|| Error::msg(format!("operand %{} not yet computed", id.index())))
}
