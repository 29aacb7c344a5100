//! The flowgraph runtime: builds ring buffers, sample multiplexers,
//! and runners from a validated [`Flowgraph`], and drives the graph's
//! start/wait/stop/run/call lifecycle.

use std::any::Any;
use std::collections::HashMap;

use flowgraph_core::{ring_buffer, DataType, DEFAULT_CAPACITY};

use crate::block::{BlockRef, LeafId, Port};
use crate::error::{GraphError, Result};
use crate::graph::{Flowgraph, LeafEntry};
use crate::mux::SampleMultiplexer;
use crate::runner::{BlockRunner, RawRunner, ReturnedBlock, ThreadedRunner};

/// Lifecycle states per `SPEC_FULL.md` §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct ActiveRun {
    runners: HashMap<LeafId, BlockRunner>,
    order: Vec<LeafId>,
}

/// Owns a [`Flowgraph`] and drives it through one run.
pub struct FlowgraphRuntime {
    graph: Flowgraph,
    state: RunState,
    run: Option<ActiveRun>,
    capacity: usize,
}

impl FlowgraphRuntime {
    pub fn new(graph: Flowgraph) -> Self {
        FlowgraphRuntime { graph, state: RunState::Unstarted, run: None, capacity: DEFAULT_CAPACITY }
    }

    /// Overrides the per-buffer ring capacity (`SPEC_FULL.md` §3: power
    /// of two, ≥1 MiB recommended; default is
    /// [`flowgraph_core::DEFAULT_CAPACITY`]).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn graph(&self) -> &Flowgraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Flowgraph {
        &mut self.graph
    }

    /// `_initialize`, `start`: validate, order, propagate rates, run
    /// `initialize` on every block, then build the ring buffers, sample
    /// muxes, and runners and spawn them (`SPEC_FULL.md` §4.6).
    pub fn start(&mut self) -> Result<()> {
        if self.state == RunState::Running {
            return Err(GraphError::AlreadyRunning);
        }
        self.state = RunState::Starting;
        tracing::info!("flowgraph starting");

        let (by_dst, order, rates) = match self.graph.prepare() {
            Ok(prepared) => prepared,
            Err(err) => {
                self.state = RunState::Unstarted;
                return Err(err);
            }
        };

        if self.graph.debug() {
            self.dump(&order, &by_dst, &rates);
        }

        let mut initialized = Vec::with_capacity(order.len());
        for &leaf_id in &order {
            if let Err(err) = self.graph.leaf_mut(leaf_id).initialize() {
                for done in initialized.into_iter().rev() {
                    self.graph.leaf_mut(done).deinitialize();
                }
                self.state = RunState::Unstarted;
                return Err(err);
            }
            initialized.push(leaf_id);
        }

        let runners = match self.build_runners(&order, &by_dst) {
            Ok(runners) => runners,
            Err(err) => {
                for &leaf_id in order.iter().rev() {
                    self.graph.leaf_mut(leaf_id).deinitialize();
                }
                self.state = RunState::Unstarted;
                return Err(err);
            }
        };

        let mut run = ActiveRun { runners, order };
        for runner in run.runners.values_mut() {
            runner.spawn()?;
        }
        self.run = Some(run);
        self.state = RunState::Running;
        tracing::info!("flowgraph running");
        Ok(())
    }

    fn build_runners(
        &mut self,
        order: &[LeafId],
        by_dst: &HashMap<(LeafId, usize), Port>,
    ) -> Result<HashMap<LeafId, BlockRunner>> {
        let mut num_readers: HashMap<(LeafId, usize), usize> = HashMap::new();
        for &src in by_dst.values() {
            if let BlockRef::Leaf(src_leaf) = src.owner {
                *num_readers.entry((src_leaf, src.index)).or_insert(0) += 1;
            }
        }

        let mut reader_queue: HashMap<(LeafId, usize), Vec<ring_buffer::Reader>> = HashMap::new();
        let mut writer_ports: HashMap<(LeafId, usize), (ring_buffer::Writer, DataType, usize)> = HashMap::new();

        for &leaf_id in order {
            let sig = self.graph.leaf_mut(leaf_id).type_signature();
            for (j, data_type) in sig.outputs.as_slice().iter().enumerate() {
                let readers = num_readers.get(&(leaf_id, j)).copied().unwrap_or(0);
                let (writer, readers) = ring_buffer(self.capacity, readers);
                reader_queue.insert((leaf_id, j), readers);
                writer_ports.insert((leaf_id, j), (writer, data_type.clone(), num_readers.get(&(leaf_id, j)).copied().unwrap_or(0)));
            }
        }

        let mut runners = HashMap::new();
        for &leaf_id in order {
            let sig = self.graph.leaf_mut(leaf_id).type_signature();

            let mut readers = Vec::with_capacity(sig.inputs.len());
            for (i, data_type) in sig.inputs.as_slice().iter().enumerate() {
                let src = by_dst[&(leaf_id, i)];
                let BlockRef::Leaf(src_leaf) = src.owner else {
                    unreachable!("flattened source is always a leaf")
                };
                let reader = reader_queue
                    .get_mut(&(src_leaf, src.index))
                    .and_then(|q| q.pop())
                    .expect("one reader was reserved per flattened connection");
                readers.push((reader, data_type.clone()));
            }

            let mut writers = Vec::with_capacity(sig.outputs.len());
            for j in 0..sig.outputs.len() {
                let (writer, data_type, count) = writer_ports.remove(&(leaf_id, j)).expect("writer built above");
                writers.push((writer, data_type, count));
            }

            let mux = SampleMultiplexer::new(readers, writers);
            let name = format!("leaf#{}", leaf_id.0);
            let entry = self.graph.take_leaf(leaf_id);
            let runner = match entry {
                LeafEntry::Threaded(block) => BlockRunner::Threaded(ThreadedRunner::new(name, block, mux)),
                LeafEntry::Raw(block) => BlockRunner::Raw(RawRunner::new(name, block, mux)),
            };
            runners.insert(leaf_id, runner);
        }

        Ok(runners)
    }

    /// `stop`: closes every source's output writers to request a
    /// graceful drain, then `wait`s.
    pub fn stop(&mut self) -> Result<()> {
        let sources: Vec<LeafId> = {
            let run = self.run.as_ref().ok_or(GraphError::NotRunning)?;
            run.order.iter().copied().filter(|&leaf_id| self.graph_input_count(leaf_id) == 0).collect()
        };
        self.state = RunState::Stopping;
        tracing::info!("flowgraph stopping");
        let run = self.run.as_mut().ok_or(GraphError::NotRunning)?;
        for leaf_id in sources {
            run.runners.get_mut(&leaf_id).expect("runner exists for every ordered leaf").stop();
        }
        self.wait()
    }

    fn graph_input_count(&self, leaf_id: LeafId) -> usize {
        self.graph.leaf(leaf_id).type_signature().inputs.len()
    }

    /// `wait`: joins every runner, tears down run state, hands every
    /// block back to the arena, and runs `deinitialize` on each.
    pub fn wait(&mut self) -> Result<()> {
        let mut run = self.run.take().ok_or(GraphError::NotRunning)?;
        let mut first_error = None;

        for &leaf_id in &run.order {
            let mut runner = run.runners.remove(&leaf_id).expect("runner exists for every ordered leaf");
            let (returned, result) = runner.join();
            match returned {
                ReturnedBlock::Threaded(Some(block)) => self.graph.return_leaf(leaf_id, LeafEntry::Threaded(block)),
                ReturnedBlock::Raw(Some(block)) => self.graph.return_leaf(leaf_id, LeafEntry::Raw(block)),
                ReturnedBlock::Threaded(None) | ReturnedBlock::Raw(None) => {}
            }
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        for &leaf_id in run.order.iter().rev() {
            self.graph.leaf_mut(leaf_id).deinitialize();
        }

        self.state = RunState::Stopped;
        tracing::info!("flowgraph stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// `run`: `start` then `wait`.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait()
    }

    /// Dispatches a control call through the target's runner (leaves)
    /// or directly (composites, which re-enter via [`GraphHandle`]).
    pub fn call(&self, target: BlockRef, method: &str, args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        match target {
            BlockRef::Leaf(id) => {
                let run = self.run.as_ref().ok_or(GraphError::NotRunning)?;
                let runner = run.runners.get(&id).ok_or_else(|| GraphError::BlockNotFound(format!("leaf#{}", id.0)))?;
                runner.call(method, args)
            }
            BlockRef::Composite(id) => {
                if self.state != RunState::Running {
                    return Err(GraphError::NotRunning);
                }
                let handle = GraphHandle { runtime: self };
                self.graph.call_composite(id, &handle, method, args)
            }
        }
    }

    fn dump(&mut self, order: &[LeafId], by_dst: &HashMap<(LeafId, usize), Port>, rates: &[f64]) {
        let mut downstream: HashMap<(LeafId, usize), Vec<String>> = HashMap::new();
        for (&(dst_leaf, dst_idx), &src) in by_dst {
            if let BlockRef::Leaf(src_leaf) = src.owner {
                downstream.entry((src_leaf, src.index)).or_default().push(format!("leaf#{}.in{}", dst_leaf.0, dst_idx));
            }
        }

        for &leaf_id in order {
            let sig = self.graph.leaf(leaf_id).type_signature();
            let inputs: Vec<String> = (0..sig.inputs.len())
                .map(|i| {
                    let src = by_dst.get(&(leaf_id, i));
                    let upstream = match src.map(|p| p.owner) {
                        Some(BlockRef::Leaf(l)) => format!("leaf#{}.out{}", l.0, src.unwrap().index),
                        _ => "?".to_string(),
                    };
                    format!("in{i} [{:?}] <- {upstream}", sig.inputs.as_slice()[i])
                })
                .collect();
            let outputs: Vec<String> = (0..sig.outputs.len())
                .map(|j| {
                    let downstream = downstream.get(&(leaf_id, j)).map(|v| v.join(", ")).unwrap_or_default();
                    format!("out{j} [{:?}] -> {downstream}", sig.outputs.as_slice()[j])
                })
                .collect();
            tracing::debug!(
                block = format!("leaf#{}", leaf_id.0),
                rate = rates[leaf_id.0],
                inputs = inputs.join(", "),
                outputs = outputs.join(", "),
                "block prepared"
            );
        }
    }
}

/// Re-entrant handle passed to a running [`crate::composite::CompositeBlock`]'s
/// `call`, letting it dispatch into its own inner blocks through the
/// same runtime.
pub struct GraphHandle<'a> {
    runtime: &'a FlowgraphRuntime,
}

impl<'a> GraphHandle<'a> {
    pub fn call(&self, target: BlockRef, method: &str, args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        self.runtime.call(target, method, args)
    }
}
