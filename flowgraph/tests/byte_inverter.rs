//! End-to-end run: a byte source through a bitwise inverter into a
//! collecting sink.

use std::sync::{Arc, Mutex};

use flowgraph::block::{Block, ProcessResult, TypeSignature};
use flowgraph::error::Result;
use flowgraph::graph::Flowgraph;
use flowgraph::runtime::FlowgraphRuntime;
use flowgraph_core::{DataType, StackVec};

struct ByteSource {
    data: Vec<u8>,
    pos: usize,
}

impl Block for ByteSource {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[], &[DataType::UInt8])
    }

    fn process(&mut self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let remaining = self.data.len() - self.pos;
        let n = remaining.min(outputs[0].len());
        outputs[0][..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;

        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed: StackVec::new(), produced, eof: self.pos >= self.data.len() })
    }
}

struct ByteInverter;

impl Block for ByteInverter {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::UInt8], &[DataType::UInt8])
    }

    fn process(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let n = inputs[0].len();
        for i in 0..n {
            outputs[0][i] = !inputs[0][i];
        }
        let mut consumed = StackVec::new();
        consumed.push(n).unwrap();
        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed, produced, eof: false })
    }
}

struct ByteSink {
    collected: Arc<Mutex<Vec<u8>>>,
}

impl Block for ByteSink {
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
fn inverts_every_byte_end_to_end() {
    let input: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let collected = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Flowgraph::new(false);
    let source = graph.add_block(Box::new(ByteSource { data: input.clone(), pos: 0 }));
    let inverter = graph.add_block(Box::new(ByteInverter));
    let sink = graph.add_block(Box::new(ByteSink { collected: Arc::clone(&collected) }));

    graph.connect(source.into(), inverter.into()).unwrap();
    graph.connect(inverter.into(), sink.into()).unwrap();

    let mut runtime = FlowgraphRuntime::new(graph);
    runtime.run().unwrap();

    let expected: Vec<u8> = input.iter().map(|b| !b).collect();
    assert_eq!(*collected.lock().unwrap(), expected);
}
