use std::fmt;

use kiln_core::{DType, Shape};

// Graph — a job body as immutable data
//
// A Graph is the complete description of what a job computes: placeholders
// (typed, shaped inputs with no storage), operation nodes, and named
// outputs. Nothing here executes; execution engines consume the graph and
// lower it however they like (interpretation, an instruction tape, fused
// kernels).
//
// Nodes are stored in insertion order, and the builder only lets a node
// reference nodes that already exist, so insertion order IS a topological
// order. Engines rely on that: a single forward walk visits every operand
// before its consumer.

/// Identifies a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Index into the graph's node list.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The compile-time contract of a value: shape plus element type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorType {
            shape: shape.into(),
            dtype,
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.shape, self.dtype)
    }
}

/// What a node computes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// A declared job input. No storage until invocation.
    Placeholder,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Sqrt,
    Square,
    Sum { dims: Vec<usize>, keep_dim: bool },
    Mean { dims: Vec<usize>, keep_dim: bool },
    Reshape { shape: Shape },
    /// Gradient of layer normalization w.r.t. its input.
    /// Inputs: dy, x, mean, inv_variance. Statistics cover the axes from
    /// `begin_norm_axis` to the end.
    LayerNormGrad { begin_norm_axis: usize },
}

impl OpKind {
    /// Short operator name, used in dumps and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Placeholder => "placeholder",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Sqrt => "sqrt",
            OpKind::Square => "square",
            OpKind::Sum { .. } => "sum",
            OpKind::Mean { .. } => "mean",
            OpKind::Reshape { .. } => "reshape",
            OpKind::LayerNormGrad { .. } => "layer_norm_grad",
        }
    }

    /// Whether this op maps elements independently (same-position inputs
    /// produce the output at that position). Fusion-oriented engines only
    /// handle these.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Div
                | OpKind::Neg
                | OpKind::Sqrt
                | OpKind::Square
        )
    }
}

/// One operation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: OpKind,
    /// Operands, in argument order.
    pub inputs: Vec<NodeId>,
    /// Inferred output contract.
    pub ty: TensorType,
}

/// A declared input: position in this list is invocation argument order.
#[derive(Debug, Clone)]
pub struct PlaceholderSpec {
    pub node_id: NodeId,
    pub name: String,
    pub ty: TensorType,
}

/// A named graph output.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub node_id: NodeId,
}

/// An immutable, validated job body.
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) placeholders: Vec<PlaceholderSpec>,
    pub(crate) outputs: Vec<OutputSpec>,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Declared inputs, in invocation order.
    pub fn placeholders(&self) -> &[PlaceholderSpec] {
        &self.placeholders
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    /// Node ids in execution order. Insertion order is topological by
    /// construction.
    pub fn topo_order(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Number of consumers of each node. Engines use this for liveness
    /// (free a value after its last consumer) and fusion (only fuse through
    /// single-consumer edges).
    pub fn consumer_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for input in &node.inputs {
                counts[input.0] += 1;
            }
        }
        for output in &self.outputs {
            counts[output.node_id.0] += 1;
        }
        counts
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {{")?;
        for node in &self.nodes {
            write!(f, "  %{} = {}", node.id.0, node.op.name())?;
            if let OpKind::Placeholder = node.op {
                let name = self
                    .placeholders
                    .iter()
                    .find(|p| p.node_id == node.id)
                    .map(|p| p.name.as_str())
                    .unwrap_or("?");
                write!(f, " \"{}\"", name)?;
            } else {
                write!(f, "(")?;
                for (i, input) in node.inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "%{}", input.0)?;
                }
                write!(f, ")")?;
            }
            writeln!(f, " : {}", node.ty)?;
        }
        for output in &self.outputs {
            writeln!(f, "  output \"{}\" = %{}", output.name, output.node_id.0)?;
        }
        write!(f, "}}")
    }
}
