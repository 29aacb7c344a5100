//! The block contract: the uniform interface a processing unit must
//! satisfy to participate in a [`crate::graph::Flowgraph`].

use std::any::Any;

use flowgraph_core::{DataType, StackVec};

use crate::error::{GraphError, Result};

/// Upper bound on a single block's input port count.
pub const MAX_BLOCK_INPUTS: usize = 16;
/// Upper bound on a single block's output port count.
pub const MAX_BLOCK_OUTPUTS: usize = 16;

/// Stable handle to a leaf block owned by a [`crate::graph::Flowgraph`]'s
/// arena. See `SPEC_FULL.md` §3 for why this replaces a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafId(pub(crate) usize);

/// Stable handle to a composite block owned by the same arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositeId(pub(crate) usize);

/// Either kind of block a port, connection, or alias may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRef {
    Leaf(LeafId),
    Composite(CompositeId),
}

impl From<LeafId> for BlockRef {
    fn from(id: LeafId) -> Self {
        BlockRef::Leaf(id)
    }
}

impl From<CompositeId> for BlockRef {
    fn from(id: CompositeId) -> Self {
        BlockRef::Composite(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

/// `(owner, direction, index)`. Two ports are equal iff all three
/// fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    pub owner: BlockRef,
    pub direction: PortDirection,
    pub index: usize,
}

impl Port {
    pub fn new(owner: BlockRef, direction: PortDirection, index: usize) -> Self {
        Port { owner, direction, index }
    }
}

/// A block's input and output type signature.
#[derive(Debug, Clone)]
pub struct TypeSignature {
    pub inputs: StackVec<DataType, MAX_BLOCK_INPUTS>,
    pub outputs: StackVec<DataType, MAX_BLOCK_OUTPUTS>,
}

impl TypeSignature {
    pub fn new(inputs: &[DataType], outputs: &[DataType]) -> Self {
        let mut ins = StackVec::new();
        for t in inputs {
            ins.push(t.clone()).expect("input count exceeds MAX_BLOCK_INPUTS");
        }
        let mut outs = StackVec::new();
        for t in outputs {
            outs.push(t.clone()).expect("output count exceeds MAX_BLOCK_OUTPUTS");
        }
        TypeSignature { inputs: ins, outputs: outs }
    }
}

/// What a `process` call did, per `SPEC_FULL.md` §4.1: how many bytes
/// each input contributed and each output produced, plus whether the
/// block has nothing further to produce.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub consumed: StackVec<usize, MAX_BLOCK_INPUTS>,
    pub produced: StackVec<usize, MAX_BLOCK_OUTPUTS>,
    pub eof: bool,
}

/// The operations the engine drives on a block. Implemented by concrete
/// DSP blocks, which are outside this crate's scope (`SPEC_FULL.md` §1).
///
/// `Send` because a threaded runner moves the block onto its own
/// worker thread.
pub trait Block: Send {
    /// Static input/output type signature, derived by the block author
    /// (no runtime type reflection; see `SPEC_FULL.md` §9).
    fn type_signature(&self) -> TypeSignature;

    /// Given the upstream rate (`0.0` for sources), returns this
    /// block's own output rate. The default is the identity function,
    /// correct for any block whose rate simply follows its input.
    fn set_rate(&mut self, upstream_rate: f64) -> Result<f64> {
        Ok(upstream_rate)
    }

    /// One-shot setup, called once per run after rate propagation and
    /// before the first `process`.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// One-shot teardown, called once per run. Must tolerate being
    /// invoked on a block whose `initialize` never ran (a sibling
    /// block's `initialize` may have failed first).
    fn deinitialize(&mut self) {}

    /// Consumes from `inputs` and produces into `outputs`, each a raw
    /// byte view sized to whole samples of this block's declared
    /// types (`SPEC_FULL.md` §9: byte buffers, typed by convention
    /// rather than by the Rust type system).
    fn process(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult>;

    /// Dispatches an out-of-band control call. The default rejects
    /// every method name; concrete blocks override it for the methods
    /// they expose.
    fn call(&mut self, method: &str, _args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        Err(GraphError::UnknownMethod(method.to_string()))
    }
}
