//! A feedback loop between two leaves must be rejected at `start`,
//! before any runner thread is spawned.

use flowgraph::block::{Block, ProcessResult, TypeSignature};
use flowgraph::error::{GraphError, Result};
use flowgraph::graph::Flowgraph;
use flowgraph::runtime::FlowgraphRuntime;
use flowgraph_core::{DataType, StackVec};

struct PassThrough;

impl Block for PassThrough {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::Float32], &[DataType::Float32])
    }

    fn process(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let n = inputs[0].len() / 4;
        outputs[0][..inputs[0].len()].copy_from_slice(inputs[0]);
        let mut consumed = StackVec::new();
        consumed.push(n).unwrap();
        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed, produced, eof: false })
    }
}

#[test]
fn mutual_dependency_is_rejected_as_cyclic() {
    let mut graph = Flowgraph::new(false);
    let a = graph.add_block(Box::new(PassThrough));
    let b = graph.add_block(Box::new(PassThrough));

    graph.connect(a.into(), b.into()).unwrap();
    graph.connect(b.into(), a.into()).unwrap();

    let mut runtime = FlowgraphRuntime::new(graph);
    let err = runtime.start().unwrap_err();
    assert!(matches!(err, GraphError::CyclicDependency(_)), "expected CyclicDependency, got {err:?}");
}
