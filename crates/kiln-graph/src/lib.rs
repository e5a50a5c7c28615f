//! # kiln-graph
//!
//! Job bodies as data.
//!
//! A kiln job is declared by building an expression graph over typed, shaped
//! placeholders — an explicit [`GraphBuilder`], not a decorated function, so
//! there is no hidden capture of ambient mutable state and every structural
//! error surfaces while the graph is being built:
//!
//! ```ignore
//! let mut g = GraphBuilder::new();
//! let x = g.placeholder("x", (1, 10), DType::F32)?;
//! let y = g.placeholder("y", (1, 10), DType::F32)?;
//! let sum = g.add(x, y)?;
//! let out = g.add(sum, x)?;   // x + y + x
//! g.output("out", out)?;
//! let graph = g.finish()?;
//! ```
//!
//! The resulting [`Graph`] is immutable and fully typed; execution engines
//! lower it without re-validating.

pub mod builder;
pub mod graph;

pub use builder::GraphBuilder;
pub use graph::{Graph, Node, NodeId, OpKind, OutputSpec, PlaceholderSpec, TensorType};
