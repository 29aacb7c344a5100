//! The flowgraph model: port registry, connection map, composite
//! expansion, evaluation order, and type-and-rate validation.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use flowgraph_core::DataType;

use crate::block::{Block, BlockRef, CompositeId, LeafId, Port, PortDirection};
use crate::composite::CompositeBlock;
use crate::error::{GraphError, Result};
use crate::runner::RawBlock;
use crate::runtime::GraphHandle;

/// Either flavor of leaf block the arena can hold, selected at
/// `add_block`/`add_raw_block` time (`SPEC_FULL.md` §4.5: "two runner
/// variants, selected by the block").
pub(crate) enum LeafEntry {
    Threaded(Box<dyn Block>),
    Raw(Box<dyn RawBlock>),
}

impl LeafEntry {
    fn as_block(&self) -> &dyn Block {
        match self {
            LeafEntry::Threaded(b) => b.as_ref(),
            LeafEntry::Raw(b) => b.as_ref(),
        }
    }

    fn as_block_mut(&mut self) -> &mut dyn Block {
        match self {
            LeafEntry::Threaded(b) => b.as_mut(),
            LeafEntry::Raw(b) => b.as_mut(),
        }
    }
}

/// A connection as recorded by `connect`/`connect_port`, before alias
/// flattening: either endpoint may be a composite's port.
#[derive(Debug, Clone, Copy)]
struct Connection {
    src: Port,
    dst: Port,
}

/// A connection whose endpoints have both been resolved to leaf ports,
/// per `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Copy)]
pub struct FlattenedConnection {
    pub src: Port,
    pub dst: Port,
}

fn port_label(port: Port) -> String {
    let owner = match port.owner {
        BlockRef::Leaf(LeafId(i)) => format!("leaf#{i}"),
        BlockRef::Composite(CompositeId(i)) => format!("composite#{i}"),
    };
    let dir = match port.direction {
        PortDirection::Input => "in",
        PortDirection::Output => "out",
    };
    format!("{owner}.{dir}{}", port.index)
}

/// The top-level container: connections map, alias maps, leaf/composite
/// block arenas, and (once built) the flattened evaluation-ready graph.
pub struct Flowgraph {
    /// `None` exactly while a leaf's block has been lent out to a
    /// runner for the duration of a run (`SPEC_FULL.md` §3: the graph
    /// never owns user blocks, only borrows them between `start` and
    /// `wait`).
    leaves: Vec<Option<LeafEntry>>,
    /// Per-composite mutex rather than one big lock: a composite
    /// `call` needs mutable access to exactly one entry, reachable
    /// through the shared reference `GraphHandle` carries.
    composites: Vec<Mutex<Box<dyn CompositeBlock>>>,
    connections: Vec<Connection>,
    output_aliases: HashMap<(CompositeId, usize), Port>,
    input_aliases: HashMap<(CompositeId, usize), Vec<Port>>,
    connected_composites: Vec<bool>,
    debug: bool,
}

impl Flowgraph {
    pub fn new(debug: bool) -> Self {
        Flowgraph {
            leaves: Vec::new(),
            composites: Vec::new(),
            connections: Vec::new(),
            output_aliases: HashMap::new(),
            input_aliases: HashMap::new(),
            connected_composites: Vec::new(),
            debug,
        }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn add_block(&mut self, block: Box<dyn Block>) -> LeafId {
        let id = LeafId(self.leaves.len());
        self.leaves.push(Some(LeafEntry::Threaded(block)));
        id
    }

    /// Adds a leaf driven by its own thread via `RawBlock::start`
    /// rather than looped by a [`crate::runner::ThreadedRunner`].
    pub fn add_raw_block(&mut self, block: Box<dyn RawBlock>) -> LeafId {
        let id = LeafId(self.leaves.len());
        self.leaves.push(Some(LeafEntry::Raw(block)));
        id
    }

    pub fn add_composite(&mut self, composite: Box<dyn CompositeBlock>) -> CompositeId {
        let id = CompositeId(self.composites.len());
        self.composites.push(Mutex::new(composite));
        self.connected_composites.push(false);
        id
    }

    /// Panics if called while the leaf is lent out to a runner
    /// (between `start` and `wait`); the flowgraph model is only ever
    /// touched outside that window (`SPEC_FULL.md` §5).
    pub fn leaf(&self, id: LeafId) -> &dyn Block {
        self.leaves[id.0].as_ref().expect("leaf is on loan to its runner").as_block()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Takes leaf `id`'s block out of the arena for the duration of a
    /// run, leaving `None` behind until [`Self::return_leaf`].
    pub(crate) fn take_leaf(&mut self, id: LeafId) -> LeafEntry {
        self.leaves[id.0].take().expect("leaf already on loan")
    }

    pub(crate) fn return_leaf(&mut self, id: LeafId, entry: LeafEntry) {
        self.leaves[id.0] = Some(entry);
    }

    pub(crate) fn leaf_mut(&mut self, id: LeafId) -> &mut dyn Block {
        self.leaves[id.0].as_mut().expect("leaf is on loan to its runner").as_block_mut()
    }

    pub fn composite_count(&self) -> usize {
        self.composites.len()
    }

    /// Dispatches a control call to composite `id`'s own `call`,
    /// handing it `handle` so it can re-enter the runtime for its
    /// inner blocks. Takes `&self`: the per-composite mutex is the
    /// only mutable access this needs, so it is reachable through the
    /// shared reference a [`GraphHandle`] carries.
    pub(crate) fn call_composite(
        &self,
        id: CompositeId,
        handle: &GraphHandle,
        method: &str,
        args: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>> {
        let mut composite = self.composites[id.0].lock().expect("composite mutex poisoned");
        composite.call(handle, method, args)
    }

    fn ensure_composite_connected(&mut self, id: CompositeId) -> Result<()> {
        if self.connected_composites[id.0] {
            return Ok(());
        }
        self.connected_composites[id.0] = true;
        let mut composite = std::mem::replace(&mut *self.composites[id.0].lock().expect("composite mutex poisoned"), empty_composite());
        let result = composite.connect(id, self);
        *self.composites[id.0].lock().expect("composite mutex poisoned") = composite;
        result
    }

    /// Registers an output alias: `composite.output_index` is backed by
    /// exactly `inner`. Called from a composite's `connect`.
    pub fn alias_output(&mut self, composite: CompositeId, output_index: usize, inner: Port) {
        self.output_aliases.insert((composite, output_index), inner);
    }

    /// Registers (or extends) an input alias: `composite.input_index`
    /// fans out to `inner` along with any inner ports already
    /// registered for the same composite input.
    pub fn alias_input(&mut self, composite: CompositeId, input_index: usize, inner: Port) {
        self.input_aliases.entry((composite, input_index)).or_default().push(inner);
    }

    /// `connect(src, dst)`, valid only when both sides expose exactly
    /// one port (`SPEC_FULL.md` §4.4.1 form (a)).
    pub fn connect(&mut self, src: BlockRef, dst: BlockRef) -> Result<()> {
        let src_count = self.port_count(src, PortDirection::Output)?;
        let dst_count = self.port_count(dst, PortDirection::Input)?;
        if src_count != 1 || dst_count != 1 {
            return Err(GraphError::InvalidPortCount { src: src_count, dst: dst_count });
        }
        self.connect_port(src, 0, dst, 0)
    }

    /// `connect_port(src, outIndex, dst, inIndex)` (`SPEC_FULL.md` §4.4.1
    /// form (b); port names are resolved to indices by the caller, as
    /// names are a block-author convenience rather than part of this
    /// engine's model).
    pub fn connect_port(&mut self, src: BlockRef, out_index: usize, dst: BlockRef, in_index: usize) -> Result<()> {
        if let BlockRef::Composite(id) = src {
            self.ensure_composite_connected(id)?;
        }
        if let BlockRef::Composite(id) = dst {
            self.ensure_composite_connected(id)?;
        }

        let src_port = Port::new(src, PortDirection::Output, out_index);
        let dst_port = Port::new(dst, PortDirection::Input, in_index);

        if out_index >= self.port_count(src, PortDirection::Output)? {
            return Err(GraphError::PortNotFound(port_label(src_port)));
        }
        if in_index >= self.port_count(dst, PortDirection::Input)? {
            return Err(GraphError::PortNotFound(port_label(dst_port)));
        }

        if self.connections.iter().any(|c| c.dst == dst_port) {
            return Err(GraphError::PortAlreadyConnected(port_label(dst_port)));
        }

        self.connections.push(Connection { src: src_port, dst: dst_port });
        Ok(())
    }

    fn port_count(&self, owner: BlockRef, direction: PortDirection) -> Result<usize> {
        Ok(match owner {
            BlockRef::Leaf(id) => {
                let sig = self.leaf(id).type_signature();
                match direction {
                    PortDirection::Input => sig.inputs.len(),
                    PortDirection::Output => sig.outputs.len(),
                }
            }
            BlockRef::Composite(id) => {
                let composite = self.composites[id.0].lock().expect("composite mutex poisoned");
                match direction {
                    PortDirection::Input => composite.input_count(),
                    PortDirection::Output => composite.output_count(),
                }
            }
        })
    }

    /// Follows the output-alias chain from a composite output until a
    /// leaf output is reached (`SPEC_FULL.md` §4.4.2, source side).
    fn resolve_output(&self, port: Port) -> Result<Port> {
        let mut current = port;
        loop {
            match current.owner {
                BlockRef::Leaf(_) => return Ok(current),
                BlockRef::Composite(id) => {
                    let inner = self
                        .output_aliases
                        .get(&(id, current.index))
                        .ok_or_else(|| GraphError::UnderlyingPortNotFound(port_label(port)))?;
                    current = *inner;
                }
            }
        }
    }

    /// Expands the input-alias tree from a composite input into every
    /// reachable leaf input (`SPEC_FULL.md` §4.4.2, destination side;
    /// fan-out is allowed).
    fn resolve_inputs(&self, port: Port) -> Result<Vec<Port>> {
        match port.owner {
            BlockRef::Leaf(_) => Ok(vec![port]),
            BlockRef::Composite(id) => {
                let inner_ports = self
                    .input_aliases
                    .get(&(id, port.index))
                    .ok_or_else(|| GraphError::UnderlyingPortNotFound(port_label(port)))?;
                let mut leaves = Vec::new();
                for inner in inner_ports {
                    leaves.extend(self.resolve_inputs(*inner)?);
                }
                Ok(leaves)
            }
        }
    }

    /// Walks every recorded connection's alias chains to produce the
    /// leaf-to-leaf map the runtime consumes (`SPEC_FULL.md` §4.4.2).
    fn flatten(&self) -> Result<Vec<FlattenedConnection>> {
        let mut flattened = Vec::new();
        for conn in &self.connections {
            let src = self.resolve_output(conn.src)?;
            for dst in self.resolve_inputs(conn.dst)? {
                flattened.push(FlattenedConnection { src, dst });
            }
        }
        Ok(flattened)
    }

    fn leaf_data_type(&self, port: Port) -> DataType {
        let BlockRef::Leaf(id) = port.owner else {
            unreachable!("flattened ports are always leaves");
        };
        let sig = self.leaf(id).type_signature();
        match port.direction {
            PortDirection::Input => sig.inputs.as_slice()[port.index].clone(),
            PortDirection::Output => sig.outputs.as_slice()[port.index].clone(),
        }
    }

    /// Validates connectivity and type-compatibility
    /// (`SPEC_FULL.md` §4.4.3) and returns the flattened map indexed by
    /// leaf destination.
    fn validate(&self) -> Result<HashMap<(LeafId, usize), Port>> {
        let flattened = self.flatten()?;
        let mut by_dst = HashMap::new();
        for conn in &flattened {
            let BlockRef::Leaf(dst_leaf) = conn.dst.owner else { unreachable!() };
            by_dst.insert((dst_leaf, conn.dst.index), conn.src);
        }

        for leaf_id in 0..self.leaves.len() {
            let sig = self.leaf(LeafId(leaf_id)).type_signature();
            for i in 0..sig.inputs.len() {
                let dst_port = Port::new(BlockRef::Leaf(LeafId(leaf_id)), PortDirection::Input, i);
                let src = by_dst
                    .get(&(LeafId(leaf_id), i))
                    .copied()
                    .ok_or_else(|| GraphError::InputPortUnconnected(port_label(dst_port)))?;

                let expected = sig.inputs.as_slice()[i].clone();
                let found = self.leaf_data_type(src);
                if expected != found {
                    return Err(GraphError::DataTypeMismatch { input: port_label(dst_port), expected, found });
                }
            }
        }

        Ok(by_dst)
    }

    /// Kahn's algorithm over the flattened leaf graph
    /// (`SPEC_FULL.md` §4.4.4): sources (no predecessors) come first;
    /// an incomplete pass means a cycle.
    fn evaluation_order(&self, by_dst: &HashMap<(LeafId, usize), Port>) -> Result<Vec<LeafId>> {
        let n = self.leaves.len();
        let mut in_degree = vec![0usize; n];
        let mut adjacency: Vec<Vec<LeafId>> = vec![Vec::new(); n];

        for (&(dst_leaf, _), &src) in by_dst {
            if let BlockRef::Leaf(src_leaf) = src.owner {
                adjacency[src_leaf.0].push(dst_leaf);
                in_degree[dst_leaf.0] += 1;
            }
        }

        let mut queue: Vec<LeafId> = (0..n).filter(|&i| in_degree[i] == 0).map(LeafId).collect();
        let mut order = Vec::with_capacity(n);
        let mut cursor = 0;
        while cursor < queue.len() {
            let block = queue[cursor];
            cursor += 1;
            order.push(block);
            for &neighbor in &adjacency[block.0] {
                in_degree[neighbor.0] -= 1;
                if in_degree[neighbor.0] == 0 {
                    queue.push(neighbor);
                }
            }
        }

        if order.len() != n {
            let stuck = (0..n).find(|&i| in_degree[i] > 0).expect("order shorter than n implies a stuck block");
            return Err(GraphError::CyclicDependency(format!("leaf#{stuck}")));
        }

        Ok(order)
    }

    /// Propagates rates in evaluation order (`SPEC_FULL.md` §4.4.5):
    /// sources call `set_rate(0)`; others call `set_rate` with input
    /// 0's upstream rate and verify every other input agrees.
    fn propagate_rates(&mut self, order: &[LeafId], by_dst: &HashMap<(LeafId, usize), Port>) -> Result<Vec<f64>> {
        let mut rates = vec![0.0f64; self.leaves.len()];
        for &leaf_id in order {
            let input_count = self.leaf(leaf_id).type_signature().inputs.len();
            let upstream_rate = if input_count == 0 {
                0.0
            } else {
                let src0 = by_dst[&(leaf_id, 0)];
                let BlockRef::Leaf(src_leaf) = src0.owner else { unreachable!() };
                rates[src_leaf.0]
            };

            for i in 1..input_count {
                let src_i = by_dst[&(leaf_id, i)];
                let BlockRef::Leaf(src_leaf) = src_i.owner else { unreachable!() };
                if rates[src_leaf.0] != upstream_rate {
                    return Err(GraphError::RateMismatch {
                        block: format!("leaf#{}", leaf_id.0),
                        index: i,
                        expected: upstream_rate,
                        found: rates[src_leaf.0],
                    });
                }
            }

            let rate = self.leaf_mut(leaf_id).set_rate(upstream_rate)?;
            rates[leaf_id.0] = rate;
        }
        Ok(rates)
    }

    /// Runs validation, evaluation ordering, and rate propagation, in
    /// that order (`SPEC_FULL.md` §4.6 step 1). Returns the flattened
    /// map, the evaluation order, and each leaf's resolved rate.
    pub(crate) fn prepare(&mut self) -> Result<(HashMap<(LeafId, usize), Port>, Vec<LeafId>, Vec<f64>)> {
        let by_dst = self.validate()?;
        let order = self.evaluation_order(&by_dst)?;
        let rates = self.propagate_rates(&order, &by_dst)?;
        Ok((by_dst, order, rates))
    }
}

/// A no-op placeholder swapped in while a composite's own `connect` is
/// mid-call, since `connect` takes `&mut Flowgraph` and the composite
/// itself lives inside `self.composites`.
fn empty_composite() -> Box<dyn CompositeBlock> {
    struct Empty;
    impl CompositeBlock for Empty {
        fn input_count(&self) -> usize {
            0
        }
        fn output_count(&self) -> usize {
            0
        }
        fn connect(&mut self, _id: CompositeId, _graph: &mut Flowgraph) -> Result<()> {
            Ok(())
        }
    }
    Box::new(Empty)
}
