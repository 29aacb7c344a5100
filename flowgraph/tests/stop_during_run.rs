//! `stop` on a running graph with an unbounded source should close that
//! source's output and let the chain drain to a clean `wait`.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flowgraph::block::{Block, ProcessResult, TypeSignature};
use flowgraph::error::Result;
use flowgraph::graph::Flowgraph;
use flowgraph::runtime::FlowgraphRuntime;
use flowgraph_core::{DataType, StackVec};

/// Never sets `eof`; only `stop` (closing its writer) ends this block.
struct InfiniteSource;

impl Block for InfiniteSource {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[], &[DataType::UInt8])
    }

    fn process(&mut self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let n = outputs[0].len().min(256);
        for b in outputs[0][..n].iter_mut() {
            *b = 0xAB;
        }
        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed: StackVec::new(), produced, eof: false })
    }
}

struct CollectingSink {
    collected: Arc<Mutex<Vec<u8>>>,
}

impl Block for CollectingSink {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::UInt8], &[])
    }

    fn process(&mut self, inputs: &[&[u8]], _outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        self.collected.lock().unwrap().extend_from_slice(inputs[0]);
        let n = inputs[0].len();
        let mut consumed = StackVec::new();
        consumed.push(n).unwrap();
        Ok(ProcessResult { consumed, produced: StackVec::new(), eof: false })
    }
}

#[test]
fn stop_drains_the_graph_instead_of_hanging() {
    let collected = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Flowgraph::new(false);
    let source = graph.add_block(Box::new(InfiniteSource));
    let sink = graph.add_block(Box::new(CollectingSink { collected: Arc::clone(&collected) }));
    graph.connect(source.into(), sink.into()).unwrap();

    let mut runtime = FlowgraphRuntime::new(graph);
    runtime.start().unwrap();

    thread::sleep(Duration::from_millis(50));
    runtime.stop().unwrap();

    assert!(!collected.lock().unwrap().is_empty(), "sink should have collected some bytes before stop");
}
