//! Rate propagation: a source declares its own rate regardless of the
//! zero upstream rate it's handed, and a halving block derives its own
//! rate from what it receives.

use std::sync::{Arc, Mutex};

use flowgraph::block::{Block, ProcessResult, TypeSignature};
use flowgraph::error::Result;
use flowgraph::graph::Flowgraph;
use flowgraph::runtime::FlowgraphRuntime;
use flowgraph_core::{DataType, StackVec};

struct FixedRateSource {
    native_rate: f64,
    remaining: usize,
}

impl Block for FixedRateSource {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[], &[DataType::Float32])
    }

    fn set_rate(&mut self, _upstream_rate: f64) -> Result<f64> {
        Ok(self.native_rate)
    }

    fn process(&mut self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let capacity = outputs[0].len() / 4;
        let n = self.remaining.min(capacity);
        for i in 0..n {
            outputs[0][i * 4..i * 4 + 4].copy_from_slice(&1.0f32.to_le_bytes());
        }
        self.remaining -= n;
        let mut produced = StackVec::new();
        produced.push(n).unwrap();
        Ok(ProcessResult { consumed: StackVec::new(), produced, eof: self.remaining == 0 })
    }
}

struct RateHalver {
    observed_rate: Arc<Mutex<Option<f64>>>,
}

impl Block for RateHalver {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::Float32], &[DataType::Float32])
    }

    fn set_rate(&mut self, upstream_rate: f64) -> Result<f64> {
        let half = upstream_rate / 2.0;
        *self.observed_rate.lock().unwrap() = Some(half);
        Ok(half)
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

struct Drain;

impl Block for Drain {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::new(&[DataType::Float32], &[])
    }

    fn process(&mut self, inputs: &[&[u8]], _outputs: &mut [&mut [u8]]) -> Result<ProcessResult> {
        let n = inputs[0].len() / 4;
        let mut consumed = StackVec::new();
        consumed.push(n).unwrap();
        Ok(ProcessResult { consumed, produced: StackVec::new(), eof: false })
    }
}

#[test]
fn halver_derives_half_the_upstream_rate() {
    let observed_rate = Arc::new(Mutex::new(None));

    let mut graph = Flowgraph::new(false);
    let source = graph.add_block(Box::new(FixedRateSource { native_rate: 44_100.0, remaining: 64 }));
    let halver = graph.add_block(Box::new(RateHalver { observed_rate: Arc::clone(&observed_rate) }));
    let drain = graph.add_block(Box::new(Drain));

    graph.connect(source.into(), halver.into()).unwrap();
    graph.connect(halver.into(), drain.into()).unwrap();

    let mut runtime = FlowgraphRuntime::new(graph);
    runtime.run().unwrap();

    assert_eq!(*observed_rate.lock().unwrap(), Some(22_050.0));
}
