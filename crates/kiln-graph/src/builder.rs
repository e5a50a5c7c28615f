use std::collections::HashSet;

use kiln_core::{bail, DType, Error, Result, Shape};

use crate::graph::{Graph, Node, NodeId, OpKind, OutputSpec, PlaceholderSpec, TensorType};

// GraphBuilder — construct and type-check a job body
//
// The builder is the only way to make a Graph, and every node is checked as
// it is inserted: operand dtypes must agree, shapes must broadcast, reshapes
// must preserve element counts, and layer_norm_grad's statistics shapes must
// match its split axis. The payoff is that engines never re-validate — by
// the time a Graph exists, an invocation can only fail on the concrete
// inputs, never on the structure.
//
//   let mut g = GraphBuilder::new();
//   let x = g.placeholder("x", (1, 10), DType::F32)?;
//   let y = g.placeholder("y", (1, 10), DType::F32)?;
//   let sum = g.add(x, y)?;
//   let out = g.add(sum, x)?;
//   g.output("out", out)?;
//   let graph = g.finish()?;

/// Builds a [`Graph`] one node at a time, inferring types as it goes.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    placeholders: Vec<PlaceholderSpec>,
    outputs: Vec<OutputSpec>,
    placeholder_names: HashSet<String>,
    output_names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, op: OpKind, inputs: Vec<NodeId>, ty: TensorType) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, op, inputs, ty });
        id
    }

    fn ty(&self, id: NodeId) -> Result<&TensorType> {
        match self.nodes.get(id.0) {
            Some(node) => Ok(&node.ty),
            None => Err(Error::msg(format!(
                "node %{} does not belong to this builder",
                id.0
            ))),
        }
    }

    /// Declare a typed, shaped input. Placeholder order is invocation order.
    pub fn placeholder(
        &mut self,
        name: impl Into<String>,
        shape: impl Into<Shape>,
        dtype: DType,
    ) -> Result<NodeId> {
        let name = name.into();
        if !self.placeholder_names.insert(name.clone()) {
            bail!("duplicate placeholder name '{}'", name);
        }
        let ty = TensorType::new(shape, dtype);
        let id = self.push(OpKind::Placeholder, vec![], ty.clone());
        self.placeholders.push(PlaceholderSpec {
            node_id: id,
            name,
            ty,
        });
        Ok(id)
    }

    // Elementwise arithmetic

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(OpKind::Div, lhs, rhs)
    }

    fn binary(&mut self, op: OpKind, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let lt = self.ty(lhs)?.clone();
        let rt = self.ty(rhs)?.clone();
        if lt.dtype != rt.dtype {
            return Err(Error::DTypeMismatch {
                expected: lt.dtype,
                got: rt.dtype,
            });
        }
        let shape = Shape::broadcast_shape(&lt.shape, &rt.shape)?;
        let ty = TensorType::new(shape, lt.dtype);
        Ok(self.push(op, vec![lhs, rhs], ty))
    }

    pub fn neg(&mut self, input: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Neg, input)
    }

    pub fn sqrt(&mut self, input: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Sqrt, input)
    }

    pub fn square(&mut self, input: NodeId) -> Result<NodeId> {
        self.unary(OpKind::Square, input)
    }

    fn unary(&mut self, op: OpKind, input: NodeId) -> Result<NodeId> {
        let ty = self.ty(input)?.clone();
        Ok(self.push(op, vec![input], ty))
    }

    // Reductions

    pub fn sum(&mut self, input: NodeId, dims: &[usize], keep_dim: bool) -> Result<NodeId> {
        self.reduce(input, dims, keep_dim, true)
    }

    pub fn mean(&mut self, input: NodeId, dims: &[usize], keep_dim: bool) -> Result<NodeId> {
        self.reduce(input, dims, keep_dim, false)
    }

    fn reduce(
        &mut self,
        input: NodeId,
        dims: &[usize],
        keep_dim: bool,
        is_sum: bool,
    ) -> Result<NodeId> {
        let ty = self.ty(input)?.clone();
        let rank = ty.shape.rank();
        let mut seen = HashSet::new();
        for &d in dims {
            if d >= rank {
                return Err(Error::DimOutOfRange { dim: d, rank });
            }
            if !seen.insert(d) {
                bail!("duplicate reduce dimension {}", d);
            }
        }
        let out_shape = kiln_core::tensor::reduced_shape(&ty.shape, dims, keep_dim);
        let op = if is_sum {
            OpKind::Sum {
                dims: dims.to_vec(),
                keep_dim,
            }
        } else {
            OpKind::Mean {
                dims: dims.to_vec(),
                keep_dim,
            }
        };
        Ok(self.push(op, vec![input], TensorType::new(out_shape, ty.dtype)))
    }

    // Shape ops

    pub fn reshape(&mut self, input: NodeId, shape: impl Into<Shape>) -> Result<NodeId> {
        let ty = self.ty(input)?.clone();
        let shape = shape.into();
        if shape.elem_count() != ty.shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: ty.shape.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        let out_ty = TensorType::new(shape.clone(), ty.dtype);
        Ok(self.push(OpKind::Reshape { shape }, vec![input], out_ty))
    }

    // Layer-norm gradient

    /// Gradient of layer normalization w.r.t. `x`.
    ///
    /// `dy` and `x` share one shape; `mean` and `inv_variance` carry the
    /// statistics shape `x.shape[..begin_norm_axis]`. A negative axis counts
    /// from the right (-1 = last axis), as usual for normalization APIs.
    pub fn layer_norm_grad(
        &mut self,
        dy: NodeId,
        x: NodeId,
        mean: NodeId,
        inv_variance: NodeId,
        begin_norm_axis: i64,
    ) -> Result<NodeId> {
        let dy_ty = self.ty(dy)?.clone();
        let x_ty = self.ty(x)?.clone();
        let mean_ty = self.ty(mean)?.clone();
        let inv_var_ty = self.ty(inv_variance)?.clone();

        for other in [&x_ty, &mean_ty, &inv_var_ty] {
            if other.dtype != dy_ty.dtype {
                return Err(Error::DTypeMismatch {
                    expected: dy_ty.dtype,
                    got: other.dtype,
                });
            }
        }
        if dy_ty.shape != x_ty.shape {
            return Err(Error::ShapeMismatch {
                expected: x_ty.shape,
                got: dy_ty.shape,
            });
        }

        let rank = x_ty.shape.rank() as i64;
        let axis = if begin_norm_axis < 0 {
            begin_norm_axis + rank
        } else {
            begin_norm_axis
        };
        if axis <= 0 || axis >= rank {
            bail!(
                "begin_norm_axis {} leaves no leading or no trailing axes for shape {}",
                begin_norm_axis,
                x_ty.shape
            );
        }
        let axis = axis as usize;

        let stats_shape = x_ty.shape.leading(axis);
        for (label, ty) in [("mean", &mean_ty), ("inv_variance", &inv_var_ty)] {
            if ty.shape != stats_shape {
                return Err(Error::PlaceholderViolation {
                    placeholder: label.to_string(),
                    reason: format!("expected statistics shape {}, got {}", stats_shape, ty.shape),
                });
            }
        }

        Ok(self.push(
            OpKind::LayerNormGrad {
                begin_norm_axis: axis,
            },
            vec![dy, x, mean, inv_variance],
            x_ty,
        ))
    }

    // Outputs and finalization

    /// Mark a node as a named output.
    pub fn output(&mut self, name: impl Into<String>, node: NodeId) -> Result<()> {
        let name = name.into();
        self.ty(node)?;
        if !self.output_names.insert(name.clone()) {
            bail!("duplicate output name '{}'", name);
        }
        self.outputs.push(OutputSpec {
            name,
            node_id: node,
        });
        Ok(())
    }

    /// Validate and freeze the graph.
    pub fn finish(self) -> Result<Graph> {
        if self.outputs.is_empty() {
            bail!("graph has no outputs");
        }
        Ok(Graph {
            nodes: self.nodes,
            placeholders: self.placeholders,
            outputs: self.outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_placeholder(
        g: &mut GraphBuilder,
        name: &str,
        shape: impl Into<Shape>,
    ) -> NodeId {
        g.placeholder(name, shape, DType::F32).unwrap()
    }

    #[test]
    fn builds_the_double_add_body() {
        // x + y + x — the canonical elementwise job body.
        let mut g = GraphBuilder::new();
        let x = f32_placeholder(&mut g, "x", (1, 10));
        let y = f32_placeholder(&mut g, "y", (1, 10));
        let sum = g.add(x, y).unwrap();
        let out = g.add(sum, x).unwrap();
        g.output("out", out).unwrap();
        let graph = g.finish().unwrap();

        assert_eq!(graph.nodes().len(), 4);
        assert_eq!(graph.placeholders().len(), 2);
        assert_eq!(graph.node(out).ty.shape.dims(), &[1, 10]);
    }

    #[test]
    fn binary_infers_broadcast_shape() {
        let mut g = GraphBuilder::new();
        let a = f32_placeholder(&mut g, "a", (2, 1));
        let b = f32_placeholder(&mut g, "b", (1, 3));
        let c = g.mul(a, b).unwrap();
        assert_eq!(g.ty(c).unwrap().shape.dims(), &[2, 3]);
    }

    #[test]
    fn binary_rejects_dtype_mismatch() {
        let mut g = GraphBuilder::new();
        let a = g.placeholder("a", 3, DType::F32).unwrap();
        let b = g.placeholder("b", 3, DType::F64).unwrap();
        assert!(matches!(g.add(a, b), Err(Error::DTypeMismatch { .. })));
    }

    #[test]
    fn binary_rejects_incompatible_shapes() {
        let mut g = GraphBuilder::new();
        let a = f32_placeholder(&mut g, "a", 3);
        let b = f32_placeholder(&mut g, "b", 4);
        assert!(matches!(g.add(a, b), Err(Error::BroadcastMismatch { .. })));
    }

    #[test]
    fn duplicate_placeholder_name_rejected() {
        let mut g = GraphBuilder::new();
        f32_placeholder(&mut g, "x", 3);
        assert!(g.placeholder("x", 3, DType::F32).is_err());
    }

    #[test]
    fn reduce_checks_dims() {
        let mut g = GraphBuilder::new();
        let x = f32_placeholder(&mut g, "x", (2, 3));
        assert!(g.mean(x, &[2], false).is_err());
        assert!(g.sum(x, &[1, 1], false).is_err());
        let m = g.mean(x, &[1], true).unwrap();
        assert_eq!(g.ty(m).unwrap().shape.dims(), &[2, 1]);
    }

    #[test]
    fn reshape_preserves_element_count() {
        let mut g = GraphBuilder::new();
        let x = f32_placeholder(&mut g, "x", (2, 10, 2));
        let flat = g.reshape(x, (4, 10)).unwrap();
        assert_eq!(g.ty(flat).unwrap().shape.dims(), &[4, 10]);
        assert!(g.reshape(x, (3, 10)).is_err());
    }

    #[test]
    fn layer_norm_grad_type_checks() {
        let mut g = GraphBuilder::new();
        let dy = f32_placeholder(&mut g, "dy", (2, 10, 2));
        let x = f32_placeholder(&mut g, "x", (2, 10, 2));
        let mean = f32_placeholder(&mut g, "mean", (2, 10));
        let inv_var = f32_placeholder(&mut g, "inv_variance", (2, 10));
        // -1 resolves to the last axis; stats shape is [2, 10].
        let dx = g.layer_norm_grad(dy, x, mean, inv_var, -1).unwrap();
        assert_eq!(g.ty(dx).unwrap().shape.dims(), &[2, 10, 2]);
    }

    #[test]
    fn layer_norm_grad_rejects_bad_stats_shape() {
        let mut g = GraphBuilder::new();
        let dy = f32_placeholder(&mut g, "dy", (2, 10, 2));
        let x = f32_placeholder(&mut g, "x", (2, 10, 2));
        let mean = f32_placeholder(&mut g, "mean", (2, 5));
        let inv_var = f32_placeholder(&mut g, "inv_variance", (2, 5));
        assert!(matches!(
            g.layer_norm_grad(dy, x, mean, inv_var, -1),
            Err(Error::PlaceholderViolation { .. })
        ));
    }

    #[test]
    fn layer_norm_grad_rejects_degenerate_axis() {
        let mut g = GraphBuilder::new();
        let dy = f32_placeholder(&mut g, "dy", (2, 10));
        let x = f32_placeholder(&mut g, "x", (2, 10));
        let mean = f32_placeholder(&mut g, "mean", ());
        let inv_var = f32_placeholder(&mut g, "inv_variance", ());
        // Axis 0 would leave an empty statistics shape.
        assert!(g.layer_norm_grad(dy, x, mean, inv_var, 0).is_err());
        assert!(g.layer_norm_grad(dy, x, mean, inv_var, 2).is_err());
    }

    #[test]
    fn finish_requires_an_output() {
        let mut g = GraphBuilder::new();
        f32_placeholder(&mut g, "x", 3);
        assert!(g.finish().is_err());
    }

    #[test]
    fn duplicate_output_name_rejected() {
        let mut g = GraphBuilder::new();
        let x = f32_placeholder(&mut g, "x", 3);
        g.output("out", x).unwrap();
        assert!(g.output("out", x).is_err());
    }

    #[test]
    fn display_dump_mentions_ops_and_outputs() {
        let mut g = GraphBuilder::new();
        let x = f32_placeholder(&mut g, "x", (1, 10));
        let y = f32_placeholder(&mut g, "y", (1, 10));
        let s = g.add(x, y).unwrap();
        g.output("out", s).unwrap();
        let dump = g.finish().unwrap().to_string();
        assert!(dump.contains("placeholder \"x\""));
        assert!(dump.contains("add(%0, %1)"));
        assert!(dump.contains("output \"out\" = %2"));
    }

    #[test]
    fn consumer_counts_include_outputs() {
        let mut g = GraphBuilder::new();
        let x = f32_placeholder(&mut g, "x", 3);
        let y = f32_placeholder(&mut g, "y", 3);
        let s = g.add(x, y).unwrap();
        let t = g.add(s, x).unwrap();
        g.output("out", t).unwrap();
        let graph = g.finish().unwrap();
        // x feeds both adds; s feeds one add; t feeds the output.
        assert_eq!(graph.consumer_counts(), vec![2, 1, 1, 1]);
    }
}
