//! Composite blocks: a named group of inner blocks presented to the
//! rest of the graph as a single block, with its ports aliased to
//! ports on those inner blocks.

use std::any::Any;

use crate::block::CompositeId;
use crate::error::{GraphError, Result};
use crate::graph::Flowgraph;
use crate::runtime::GraphHandle;

/// A group of blocks exposed as a single block via aliased ports.
///
/// `connect` is invoked exactly once per composite, lazily, the first
/// time the graph owner wires one of its ports — it populates the
/// composite's own inner blocks, connections, and aliases by calling
/// back into the [`Flowgraph`] it is handed.
pub trait CompositeBlock: Send {
    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    /// Wires this composite's inner blocks into `graph` and registers
    /// its port aliases under `id`, its own handle. Called at most once
    /// per composite instance.
    fn connect(&mut self, id: CompositeId, graph: &mut Flowgraph) -> Result<()>;

    /// Dispatches a control call received on one of this composite's
    /// ports to the appropriate inner block, re-entering `graph` to do
    /// so. The default rejects every method name.
    fn call(&mut self, _graph: &GraphHandle, method: &str, _args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        Err(GraphError::UnknownMethod(method.to_string()))
    }
}
