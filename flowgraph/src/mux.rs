//! Per-block sample multiplexer: presents typed slice views over a
//! block's input readers and output writers, and coordinates
//! reference-counted sample lifetimes between them.

use std::time::{Duration, Instant};

use flowgraph_core::{BufferError, DataType, Reader, StackVec, Writer, WriterCloser};

use crate::block::{MAX_BLOCK_INPUTS, MAX_BLOCK_OUTPUTS};
use crate::error::{GraphError, Result};

struct ReaderPort {
    reader: Reader,
    data_type: DataType,
}

impl ReaderPort {
    fn available_samples(&self) -> usize {
        self.reader.available() / self.data_type.element_size()
    }
}

struct WriterPort {
    writer: Writer,
    data_type: DataType,
    /// Downstream reader count for this output. Zero means nothing is
    /// connected: `update` never commits, so the block can keep writing
    /// into the same unclaimed space forever (`SPEC_FULL.md` §4.3).
    num_readers: usize,
}

impl WriterPort {
    fn available_samples(&self) -> usize {
        self.writer.available() / self.data_type.element_size()
    }
}

/// Typed views handed to a block's `process` for one iteration, plus
/// the sample count `process` is expected to consume/produce up to.
pub struct Buffers<'a> {
    pub inputs: StackVec<&'a [u8], MAX_BLOCK_INPUTS>,
    pub outputs: StackVec<&'a mut [u8], MAX_BLOCK_OUTPUTS>,
    pub min_count: usize,
}

/// Binds one leaf block's input reader set and output writer set.
pub struct SampleMultiplexer {
    readers: StackVec<ReaderPort, MAX_BLOCK_INPUTS>,
    writers: StackVec<WriterPort, MAX_BLOCK_OUTPUTS>,
}

impl SampleMultiplexer {
    pub fn new(readers: Vec<(Reader, DataType)>, writers: Vec<(Writer, DataType, usize)>) -> Self {
        let mut r = StackVec::new();
        for (reader, data_type) in readers {
            r.push(ReaderPort { reader, data_type }).expect("input count exceeds MAX_BLOCK_INPUTS");
        }
        let mut w = StackVec::new();
        for (writer, data_type, num_readers) in writers {
            w.push(WriterPort { writer, data_type, num_readers }).expect("output count exceeds MAX_BLOCK_OUTPUTS");
        }
        SampleMultiplexer { readers: r, writers: w }
    }

    fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
        match deadline {
            None => Ok(None),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    Err(GraphError::Buffer(BufferError::Timeout))
                } else {
                    Ok(Some(d - now))
                }
            }
        }
    }

    /// Blocks until every input has at least one sample available and
    /// every connected output has at least one sample of free space,
    /// then returns the minimum sample count across all ports.
    ///
    /// Policy: on every wake, recompute all availabilities; wait on the
    /// first starved input, else the first starved output, else return.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // A writer closed from outside this block's own thread (a
            // `stop` on a source) is this block's cue to wind down, the
            // same as an upstream end-of-stream would be.
            if self.writers.as_slice().iter().any(|w| w.writer.is_closed()) {
                return Err(GraphError::Buffer(BufferError::EndOfStream));
            }
            if let Some(idx) = self.readers.as_slice().iter().position(|r| r.available_samples() == 0) {
                let remaining = Self::remaining(deadline)?;
                self.readers.as_slice()[idx].reader.wait_available(1, remaining)?;
                continue;
            }
            if let Some(idx) =
                self.writers.as_slice().iter().position(|w| w.num_readers > 0 && w.available_samples() == 0)
            {
                let remaining = Self::remaining(deadline)?;
                self.writers.as_slice()[idx].writer.wait_available(1, remaining)?;
                continue;
            }

            let mut min_samples = usize::MAX;
            for r in self.readers.as_slice() {
                min_samples = min_samples.min(r.available_samples());
            }
            for w in self.writers.as_slice() {
                if w.num_readers > 0 {
                    min_samples = min_samples.min(w.available_samples());
                }
            }
            return Ok(if min_samples == usize::MAX { 0 } else { min_samples });
        }
    }

    /// Waits indefinitely, then builds typed slices: exactly
    /// `min_count` samples per input, the entire available space per
    /// output (which may exceed `min_count`).
    pub fn get(&mut self) -> Result<Buffers<'_>> {
        let min_count = self.wait(None)?;

        let mut inputs = StackVec::new();
        for r in self.readers.as_mut_slice() {
            let bytes = min_count * r.data_type.element_size();
            inputs.push(&r.reader.buffer()[..bytes]).expect("input count exceeds MAX_BLOCK_INPUTS");
        }

        let mut outputs = StackVec::new();
        for w in self.writers.as_mut_slice() {
            outputs.push(w.writer.buffer()).expect("output count exceeds MAX_BLOCK_OUTPUTS");
        }

        Ok(Buffers { inputs, outputs, min_count })
    }

    /// Advances every reader by `consumed[i]` samples and every
    /// connected writer by `produced[j]` samples, running
    /// reference-count bookkeeping for any `RefCounted` port along the
    /// way (`SPEC_FULL.md` §4.3).
    pub fn update(&mut self, consumed: &[usize], produced: &[usize]) {
        for (r, &count) in self.readers.as_mut_slice().iter_mut().zip(consumed) {
            let element_size = r.data_type.element_size();
            if let DataType::RefCounted(kind) = &r.data_type {
                let base = r.reader.buffer().as_ptr();
                for i in 0..count {
                    // SAFETY: `count` samples were just returned as
                    // available by `buffer()`, so each slot is in range.
                    unsafe { (kind.unref)(base.add(i * element_size)) };
                }
            }
            r.reader.commit(count * element_size);
        }

        for (w, &count) in self.writers.as_mut_slice().iter_mut().zip(produced) {
            let element_size = w.data_type.element_size();
            if let DataType::RefCounted(kind) = &w.data_type {
                let base = w.writer.buffer().as_ptr();
                for i in 0..count {
                    // SAFETY: same reasoning as above, on the write side.
                    let slot = unsafe { base.add(i * element_size) };
                    if w.num_readers == 0 {
                        unsafe { (kind.unref)(slot) }; // R=0: destroy now.
                    } else {
                        unsafe { (kind.add_refs)(slot, w.num_readers - 1) }; // R=1: +0, R>1: ref by R-1.
                    }
                }
            }
            if w.num_readers > 0 {
                w.writer.commit(count * element_size);
            }
        }
    }

    /// Closer handles for every output writer, usable from outside the
    /// thread that ends up owning this mux (see `crate::runner::stop`).
    pub fn writer_closers(&self) -> Vec<WriterCloser> {
        self.writers.as_slice().iter().map(|w| w.writer.closer()).collect()
    }

    /// Closes every writer and every reader, unblocking both
    /// neighbours.
    pub fn set_eos(&mut self) {
        for r in self.readers.as_mut_slice() {
            r.reader.close();
        }
        for w in self.writers.as_mut_slice() {
            w.writer.close();
        }
    }
}
