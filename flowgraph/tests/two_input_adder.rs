//! Two independent `Int32` sources summed by a two-input adder block.

use std::sync::{Arc, Mutex};

use flowgraph::block::{Block, ProcessResult, TypeSignature};
use flowgraph::error::Result;
use flowgraph::graph::Flowgraph;
use flowgraph::runtime::FlowgraphRuntime;
use flowgraph_core::{DataType, StackVec};

struct CountSource {
    start: i32,
    remaining: usize,
}

impl Block for CountSource {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[], &[DataType::Int32])
    }

    fn process(&mut self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let capacity = outputs[0].len() / 4;
        let n = self.remaining.min(capacity);
        for i in 0..n {
            let value = self.start + i as i32;
            outputs[0][i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        self.start += n as i32;
        self.remaining -= n;

        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed: StackVec::new(), produced, eof: self.remaining == 0 })
    }
}

struct Adder;

impl Block for Adder {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::Int32, DataType::Int32], &[DataType::Int32])
    }

    fn process(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let n = inputs[0].len() / 4;
        for i in 0..n {
            let a = i32::from_le_bytes(inputs[0][i * 4..i * 4 + 4].try_into().unwrap());
            let b = i32::from_le_bytes(inputs[1][i * 4..i * 4 + 4].try_into().unwrap());
            outputs[0][i * 4..i * 4 + 4].copy_from_slice(&(a + b).to_le_bytes());
        }
        let mut consumed = StackVec::new();
        consumed.push(n).unwrap();
        consumed.push(n).unwrap();
        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed, produced, eof: false })
    }
}

struct SumSink {
    collected: Arc<Mutex<Vec<i32>>>,
}

impl Block for SumSink {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::Int32], &[])
    }

    fn process(&mut self, inputs: &[&[u8]], _outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let n = inputs[0].len() / 4;
        let mut collected = self.collected.lock().unwrap();
        for i in 0..n {
            collected.push(i32::from_le_bytes(inputs[0][i * 4..i * 4 + 4].try_into().unwrap()));
        }
        let mut consumed = StackVec::new();
        consumed.push(n).unwrap();
        Ok(ProcessResult { consumed, produced: StackVec::new(), eof: false })
    }
}

#[test]
fn sums_two_sources_sample_for_sample() {
    let collected = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Flowgraph::new(false);
    let a = graph.add_block(Box::new(CountSource { start: 0, remaining: 1000 }));
    let b = graph.add_block(Box::new(CountSource { start: 1000, remaining: 1000 }));
    let adder = graph.add_block(Box::new(Adder));
    let sink = graph.add_block(Box::new(SumSink { collected: Arc::clone(&collected) }));

    graph.connect_port(a.into(), 0, adder.into(), 0).unwrap();
    graph.connect_port(b.into(), 0, adder.into(), 1).unwrap();
    graph.connect(adder.into(), sink.into()).unwrap();

    let mut runtime = FlowgraphRuntime::new(graph);
    runtime.run().unwrap();

    let collected = collected.lock().unwrap();
    assert_eq!(collected.len(), 1000);
    for (i, &sum) in collected.iter().enumerate() {
        assert_eq!(sum, i as i32 + (1000 + i as i32));
    }
}
