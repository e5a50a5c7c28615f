// JIT Graph Compilation — lower a graph to a pre-compiled execution plan
//
// The interpreter re-walks the graph on every invocation: node lookups, an
// OpKind match per node, and a value table that keeps every intermediate
// alive until the end. The JIT does that work once, at job build time:
//
//   JitPlan      — the compiled plan for one graph
//   Instruction  — one operation with pre-resolved buffer slots
//   CompileStats — what the lowering did (slots, reuses, frees, time)
//
// The lowering runs liveness analysis over the topological order and
// assigns buffer slots linear-scan style: a value whose last consumer has
// executed returns its slot to a free list, and the next produced value
// takes it over. Values that die mid-tape and whose slot is never taken
// over get an explicit Free instruction so their storage drops early.

use std::fmt;
use std::time::Instant;

use kiln_core::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use kiln_core::error::Result;
use kiln_core::tensor::Tensor;
use kiln_core::{Error, Shape};
use kiln_graph::{Graph, OpKind};

use crate::ops;

// Instruction — one pre-compiled operation

/// A single operation in the compiled tape. Operands are buffer slot
/// indices; nothing is looked up by name or id at run time.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Bind the caller's `index`-th positional input to a slot.
    LoadInput {
        index: usize,
        name: String,
        dst: usize,
    },
    Unary {
        op: UnaryOp,
        src: usize,
        dst: usize,
    },
    Binary {
        op: BinaryOp,
        lhs: usize,
        rhs: usize,
        dst: usize,
    },
    Reduce {
        op: ReduceOp,
        src: usize,
        dst: usize,
        dims: Vec<usize>,
        keep_dim: bool,
    },
    Reshape {
        src: usize,
        dst: usize,
        shape: Shape,
    },
    LayerNormGrad {
        dy: usize,
        x: usize,
        mean: usize,
        inv_variance: usize,
        dst: usize,
        begin_norm_axis: usize,
    },
    /// Drop a dead value so its storage frees before the tape ends.
    Free { slot: usize },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::LoadInput { index, name, dst } => {
                write!(f, "load #{} \"{}\" -> s{}", index, name, dst)
            }
            Instruction::Unary { op, src, dst } => write!(f, "{:?} s{} -> s{}", op, src, dst),
            Instruction::Binary { op, lhs, rhs, dst } => {
                write!(f, "{:?} s{}, s{} -> s{}", op, lhs, rhs, dst)
            }
            Instruction::Reduce {
                op,
                src,
                dst,
                dims,
                keep_dim,
            } => write!(
                f,
                "{:?} s{} dims={:?} keep={} -> s{}",
                op, src, dims, keep_dim, dst
            ),
            Instruction::Reshape { src, dst, shape } => {
                write!(f, "reshape s{} {} -> s{}", src, shape, dst)
            }
            Instruction::LayerNormGrad {
                dy,
                x,
                mean,
                inv_variance,
                dst,
                begin_norm_axis,
            } => write!(
                f,
                "layer_norm_grad s{}, s{}, s{}, s{} axis={} -> s{}",
                dy, x, mean, inv_variance, begin_norm_axis, dst
            ),
            Instruction::Free { slot } => write!(f, "free s{}", slot),
        }
    }
}

// CompileStats

/// Statistics from lowering one graph.
#[derive(Debug, Clone)]
pub struct CompileStats {
    /// Instructions in the tape, frees included.
    pub num_instructions: usize,
    /// Nodes in the source graph.
    pub num_source_nodes: usize,
    /// Buffer slots the plan needs.
    pub num_slots: usize,
    /// Values that took over a previously freed slot.
    pub num_reused: usize,
    /// Explicit Free instructions inserted.
    pub num_frees: usize,
    /// Lowering time in microseconds.
    pub compile_time_us: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} instructions ({} source nodes), {} slots ({} reused), {} frees, compiled in {}us",
            self.num_instructions,
            self.num_source_nodes,
            self.num_slots,
            self.num_reused,
            self.num_frees,
            self.compile_time_us,
        )
    }
}

// JitPlan

/// The compiled execution plan for one graph.
pub struct JitPlan<B: Backend> {
    name: String,
    instructions: Vec<Instruction>,
    num_slots: usize,
    /// `(output name, slot)` in graph output order.
    output_slots: Vec<(String, usize)>,
    stats: CompileStats,
    device: B::Device,
}

impl<B: Backend> fmt::Debug for JitPlan<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JitPlan({}, {} instructions, {} slots)",
            self.name, self.stats.num_instructions, self.num_slots
        )
    }
}

impl<B: Backend> JitPlan<B> {
    /// Lower `graph` into an instruction tape.
    pub fn compile(name: &str, graph: &Graph, device: B::Device) -> Result<Self> {
        let start = Instant::now();
        let nodes = graph.nodes();

        // Liveness: instruction index (== node index pre-free-insertion) of
        // each value's last consumer. Outputs stay live to the end.
        let mut last_used_at: Vec<usize> = (0..nodes.len()).collect();
        for node in nodes {
            for input in &node.inputs {
                last_used_at[input.index()] = node.id.index();
            }
        }
        let is_output: Vec<bool> = {
            let mut v = vec![false; nodes.len()];
            for out in graph.outputs() {
                v[out.node_id.index()] = true;
            }
            v
        };

        // Linear-scan slot assignment over the topological order.
        let mut node_to_slot = vec![usize::MAX; nodes.len()];
        let mut free_slots: Vec<usize> = Vec::new();
        let mut next_slot = 0usize;
        let mut num_reused = 0usize;
        for node in nodes {
            let idx = node.id.index();
            // Operands whose last consumer is this node die here; their
            // slots become available for this node's own result. A repeated
            // operand (e.g. add(x, x)) must release its slot only once.
            for (k, input) in node.inputs.iter().enumerate() {
                let i = input.index();
                if node.inputs[..k].contains(input) {
                    continue;
                }
                if last_used_at[i] == idx && !is_output[i] {
                    free_slots.push(node_to_slot[i]);
                }
            }
            node_to_slot[idx] = match free_slots.pop() {
                Some(slot) => {
                    num_reused += 1;
                    slot
                }
                None => {
                    let slot = next_slot;
                    next_slot += 1;
                    slot
                }
            };
        }

        // Which slots get taken over, and at which instruction.
        let mut takeover_at: Vec<Vec<usize>> = vec![Vec::new(); next_slot];
        for node in nodes {
            takeover_at[node_to_slot[node.id.index()]].push(node.id.index());
        }

        // Build the tape.
        let mut instructions = Vec::with_capacity(nodes.len());
        for node in nodes {
            instructions.push(compile_node(graph, node, &node_to_slot)?);
        }

        // Free values that die mid-tape and whose slot is never reused
        // afterwards (reuse already recycles the others in place).
        let mut free_points: Vec<(usize, usize)> = Vec::new();
        for node in nodes {
            let idx = node.id.index();
            let slot = node_to_slot[idx];
            let last = last_used_at[idx];
            if is_output[idx] || last + 1 >= nodes.len() {
                continue;
            }
            let taken_over = takeover_at[slot].iter().any(|&p| p > idx && p <= last + 1);
            if !taken_over {
                free_points.push((slot, last));
            }
        }
        free_points.sort_by(|a, b| b.1.cmp(&a.1));
        let num_frees = free_points.len();
        for (slot, after) in &free_points {
            instructions.insert(after + 1, Instruction::Free { slot: *slot });
        }

        let output_slots = graph
            .outputs()
            .iter()
            .map(|o| (o.name.clone(), node_to_slot[o.node_id.index()]))
            .collect();

        let stats = CompileStats {
            num_instructions: instructions.len(),
            num_source_nodes: nodes.len(),
            num_slots: next_slot,
            num_reused,
            num_frees,
            compile_time_us: start.elapsed().as_micros() as u64,
        };

        Ok(JitPlan {
            name: name.to_string(),
            instructions,
            num_slots: next_slot,
            output_slots,
            stats,
            device,
        })
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Execute the tape with positional inputs.
    pub fn run(&self, inputs: &[Tensor<B>]) -> Result<Vec<(String, Tensor<B>)>> {
        let mut slots: Vec<Option<Tensor<B>>> = vec![None; self.num_slots];

        for instr in &self.instructions {
            match instr {
                Instruction::LoadInput { index, name, dst } => {
                    let tensor = inputs.get(*index).ok_or_else(|| {
                        Error::msg(format!("missing positional input {} (\"{}\")", index, name))
                    })?;
                    slots[*dst] = Some(tensor.clone());
                }

                Instruction::Unary { op, src, dst } => {
                    let t = get_slot(&slots, *src)?;
                    let result = match op {
                        UnaryOp::Neg => t.neg(),
                        UnaryOp::Sqrt => t.sqrt(),
                        UnaryOp::Square => t.square(),
                    }?;
                    slots[*dst] = Some(result);
                }

                Instruction::Binary { op, lhs, rhs, dst } => {
                    let a = get_slot(&slots, *lhs)?;
                    let b = get_slot(&slots, *rhs)?;
                    let result = match op {
                        BinaryOp::Add => a.add(b),
                        BinaryOp::Sub => a.sub(b),
                        BinaryOp::Mul => a.mul(b),
                        BinaryOp::Div => a.div(b),
                    }?;
                    slots[*dst] = Some(result);
                }

                Instruction::Reduce {
                    op,
                    src,
                    dst,
                    dims,
                    keep_dim,
                } => {
                    let t = get_slot(&slots, *src)?;
                    let result = match op {
                        ReduceOp::Sum => t.sum(dims, *keep_dim),
                        ReduceOp::Mean => t.mean(dims, *keep_dim),
                    }?;
                    slots[*dst] = Some(result);
                }

                Instruction::Reshape { src, dst, shape } => {
                    let t = get_slot(&slots, *src)?;
                    slots[*dst] = Some(t.reshape(shape.clone())?);
                }

                Instruction::LayerNormGrad {
                    dy,
                    x,
                    mean,
                    inv_variance,
                    dst,
                    begin_norm_axis,
                } => {
                    let dy_t = get_slot(&slots, *dy)?.clone();
                    let x_t = get_slot(&slots, *x)?.clone();
                    let mean_t = get_slot(&slots, *mean)?.clone();
                    let inv_t = get_slot(&slots, *inv_variance)?.clone();
                    slots[*dst] = Some(ops::layer_norm_grad(
                        &dy_t,
                        &x_t,
                        &mean_t,
                        &inv_t,
                        *begin_norm_axis,
                    )?);
                }

                Instruction::Free { slot } => {
                    slots[*slot] = None;
                }
            }
        }

        let mut outputs = Vec::with_capacity(self.output_slots.len());
        for (name, slot) in &self.output_slots {
            let tensor = slots[*slot]
                .clone()
                .ok_or_else(|| Error::UnknownOutput(name.clone()))?;
            outputs.push((name.clone(), tensor));
        }
        Ok(outputs)
    }

    /// Human-readable rendering of the compiled tape.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "JIT compiled: {}", self.name);
        for (i, instr) in self.instructions.iter().enumerate() {
            let _ = writeln!(out, "  {:02}: {}", i, instr);
        }
        let _ = writeln!(out, "Outputs:");
        for (name, slot) in &self.output_slots {
            let _ = writeln!(out, "  \"{}\" <- s{}", name, slot);
        }
        let _ = write!(out, "Stats: {}", self.stats);
        out
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// Lower one node. Slot indices are pre-resolved here, so the run loop
/// never touches the graph.
fn compile_node(graph: &Graph, node: &kiln_graph::Node, node_to_slot: &[usize]) -> Result<Instruction> {
    let dst = node_to_slot[node.id.index()];
    let slot = |idx: usize| -> Result<usize> {
        node.inputs
            .get(idx)
            .map(|id| node_to_slot[id.index()])
            .ok_or_else(|| {
                Error::msg(format!(
                    "{} node expected operand {}, has {}",
                    node.op.name(),
                    idx,
                    node.inputs.len()
                ))
            })
    };

    Ok(match &node.op {
        OpKind::Placeholder => {
            let pos = graph
                .placeholders()
                .iter()
                .position(|p| p.node_id == node.id)
                .ok_or_else(|| Error::msg("placeholder node missing from declaration list"))?;
            Instruction::LoadInput {
                index: pos,
                name: graph.placeholders()[pos].name.clone(),
                dst,
            }
        }
        OpKind::Add => Instruction::Binary {
            op: BinaryOp::Add,
            lhs: slot(0)?,
            rhs: slot(1)?,
            dst,
        },
        OpKind::Sub => Instruction::Binary {
            op: BinaryOp::Sub,
            lhs: slot(0)?,
            rhs: slot(1)?,
            dst,
        },
        OpKind::Mul => Instruction::Binary {
            op: BinaryOp::Mul,
            lhs: slot(0)?,
            rhs: slot(1)?,
            dst,
        },
        OpKind::Div => Instruction::Binary {
            op: BinaryOp::Div,
            lhs: slot(0)?,
            rhs: slot(1)?,
            dst,
        },
        OpKind::Neg => Instruction::Unary {
            op: UnaryOp::Neg,
            src: slot(0)?,
            dst,
        },
        OpKind::Sqrt => Instruction::Unary {
            op: UnaryOp::Sqrt,
            src: slot(0)?,
            dst,
        },
        OpKind::Square => Instruction::Unary {
            op: UnaryOp::Square,
            src: slot(0)?,
            dst,
        },
        OpKind::Sum { dims, keep_dim } => Instruction::Reduce {
            op: ReduceOp::Sum,
            src: slot(0)?,
            dst,
            dims: dims.clone(),
            keep_dim: *keep_dim,
        },
        OpKind::Mean { dims, keep_dim } => Instruction::Reduce {
            op: ReduceOp::Mean,
            src: slot(0)?,
            dst,
            dims: dims.clone(),
            keep_dim: *keep_dim,
        },
        OpKind::Reshape { shape } => Instruction::Reshape {
            src: slot(0)?,
            dst,
            shape: shape.clone(),
        },
        OpKind::LayerNormGrad { begin_norm_axis } => Instruction::LayerNormGrad {
            dy: slot(0)?,
            x: slot(1)?,
            mean: slot(2)?,
            inv_variance: slot(3)?,
            dst,
            begin_norm_axis: *begin_norm_axis,
        },
    })
}

fn get_slot<'a, B: Backend>(slots: &'a [Option<Tensor<B>>], idx: usize) -> Result<&'a Tensor<B>> {
    slots[idx]
        .as_ref()
        .ok_or_else(|| Error::msg(format!("buffer slot s{} is empty", idx)))
}
