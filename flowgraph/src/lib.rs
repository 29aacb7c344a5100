//! A block-based streaming dataflow engine: typed ports, composite
//! blocks, rate propagation, and threaded or self-driven block runners
//! wired together by a [`Flowgraph`] and driven by a
//! [`FlowgraphRuntime`].

pub mod block;
pub mod composite;
pub mod error;
pub mod graph;
pub mod mux;
pub mod runner;
pub mod runtime;

pub use block::{
    Block, BlockRef, CompositeId, LeafId, Port, PortDirection, ProcessResult, TypeSignature,
    MAX_BLOCK_INPUTS, MAX_BLOCK_OUTPUTS,
};
pub use composite::CompositeBlock;
pub use error::{GraphError, Result};
pub use graph::{Flowgraph, FlattenedConnection};
pub use mux::{Buffers, SampleMultiplexer};
pub use runner::{BlockRunner, CallMessage, RawBlock, RawRunner, ReturnedBlock, ThreadedRunner};
pub use runtime::{FlowgraphRuntime, GraphHandle};
