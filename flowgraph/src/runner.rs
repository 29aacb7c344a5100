//! Block runners: the per-block execution loop (threaded or raw),
//! lifecycle, and the synchronous call mailbox.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};

use flowgraph_core::{BufferError, WriterCloser};

use crate::block::Block;
use crate::error::{GraphError, Result};
use crate::mux::SampleMultiplexer;

/// One pending control call, as handed to a block's `call` (threaded
/// runners) or drained directly from the mailbox (raw runners).
pub struct CallMessage {
    pub method: String,
    pub args: Box<dyn Any + Send>,
    pub reply: SyncSender<Result<Box<dyn Any + Send>>>,
}

fn send_call(
    mailbox: &Sender<CallMessage>,
    name: &str,
    method: &str,
    args: Box<dyn Any + Send>,
) -> Result<Box<dyn Any + Send>> {
    let (reply_tx, reply_rx) = mpsc::sync_channel(0);
    mailbox
        .send(CallMessage { method: method.to_string(), args, reply: reply_tx })
        .map_err(|_| GraphError::BlockNotFound(name.to_string()))?;
    reply_rx.recv().map_err(|_| GraphError::BlockNotFound(name.to_string()))?
}

/// One worker thread driving a block's `process` loop.
///
/// Thread body: (1) drain pending control calls, (2) `process` one
/// iteration, (3) on EOS/BrokenStream or `process_result.eof`, close
/// the mux and exit; on any other error, close the mux and surface the
/// error to `join`.
pub struct ThreadedRunner {
    name: String,
    block: Option<Box<dyn Block>>,
    mux: Option<SampleMultiplexer>,
    mailbox_tx: Sender<CallMessage>,
    mailbox_rx: Option<Receiver<CallMessage>>,
    closers: Vec<WriterCloser>,
    handle: Option<JoinHandle<(Box<dyn Block>, Result<()>)>>,
}

impl ThreadedRunner {
    pub fn new(name: impl Into<String>, block: Box<dyn Block>, mux: SampleMultiplexer) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel();
        let closers = mux.writer_closers();
        ThreadedRunner {
            name: name.into(),
            block: Some(block),
            mux: Some(mux),
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            closers,
            handle: None,
        }
    }

    pub fn spawn(&mut self) -> Result<()> {
        let mut block = self.block.take().expect("ThreadedRunner::spawn called twice");
        let mut mux = self.mux.take().expect("ThreadedRunner::spawn called twice");
        let rx = self.mailbox_rx.take().expect("ThreadedRunner::spawn called twice");
        let name = self.name.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| run_loop(block.as_mut(), &mut mux, &rx)));
                let result = match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        mux.set_eos();
                        tracing::error!(block = %name, "block panicked during process");
                        Err(GraphError::BlockPanicked(name))
                    }
                };
                (block, result)
            })
            .expect("failed to spawn block runner thread");
        self.handle = Some(handle);
        Ok(())
    }

    /// Only legal for source blocks: closes this block's output
    /// writers to request a graceful drain.
    pub fn stop(&mut self) {
        for closer in &self.closers {
            closer.close();
        }
    }

    /// Joins the worker thread and hands the block back to its owner:
    /// the runtime never frees user blocks, only borrows them for the
    /// run (`SPEC_FULL.md` §3).
    pub fn join(&mut self) -> (Option<Box<dyn Block>>, Result<()>) {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok((block, result)) => (Some(block), result),
                Err(_) => (None, Err(GraphError::BlockPanicked(self.name.clone()))),
            },
            None => (None, Ok(())),
        }
    }

    pub fn call(&self, method: &str, args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        send_call(&self.mailbox_tx, &self.name, method, args)
    }
}

fn run_loop(block: &mut dyn Block, mux: &mut SampleMultiplexer, mailbox: &Receiver<CallMessage>) -> Result<()> {
    loop {
        while let Ok(msg) = mailbox.try_recv() {
            let reply = block.call(&msg.method, msg.args);
            let _ = msg.reply.send(reply);
        }

        let process_result = {
            let mut buffers = match mux.get() {
                Ok(buffers) => buffers,
                Err(GraphError::Buffer(BufferError::EndOfStream | BufferError::BrokenStream)) => {
                    mux.set_eos();
                    return Ok(());
                }
                Err(err) => {
                    mux.set_eos();
                    return Err(err);
                }
            };
            match block.process(buffers.inputs.as_slice(), buffers.outputs.as_mut_slice()) {
                Ok(result) => result,
                Err(err) => {
                    mux.set_eos();
                    return Err(err);
                }
            }
        };

        mux.update(process_result.consumed.as_slice(), process_result.produced.as_slice());

        if process_result.eof {
            mux.set_eos();
            return Ok(());
        }
    }
}

/// A block that drives itself from an external event source (a file
/// descriptor, a hardware callback) rather than being looped by a
/// runner thread.
pub trait RawBlock: Block {
    /// Commits samples to `mux` from the block's own context, polling
    /// the mailbox for control calls as it goes. Expected to run until
    /// the block's external source is exhausted or its mux is closed.
    fn start(&mut self, mux: SampleMultiplexer, mailbox: &Receiver<CallMessage>) -> Result<()>;
}

/// Runs a [`RawBlock`] on its own worker thread, so it still presents
/// the uniform `spawn`/`join`/`stop`/`call` surface even though the
/// block — not this runner — decides when to commit samples.
///
/// `stop` closes the mux's writers the same way [`ThreadedRunner::stop`]
/// does: closers are captured before the mux moves into `start`, so
/// closing them works without touching the block, which by then may be
/// running on its own thread under an external reactor.
pub struct RawRunner {
    name: String,
    block: Option<Box<dyn RawBlock>>,
    mux: Option<SampleMultiplexer>,
    mailbox_tx: Sender<CallMessage>,
    mailbox_rx: Option<Receiver<CallMessage>>,
    closers: Vec<WriterCloser>,
    handle: Option<JoinHandle<(Box<dyn RawBlock>, Result<()>)>>,
}

impl RawRunner {
    pub fn new(name: impl Into<String>, block: Box<dyn RawBlock>, mux: SampleMultiplexer) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel();
        let closers = mux.writer_closers();
        RawRunner {
            name: name.into(),
            block: Some(block),
            mux: Some(mux),
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            closers,
            handle: None,
        }
    }

    pub fn spawn(&mut self) -> Result<()> {
        let mut block = self.block.take().expect("RawRunner::spawn called twice");
        let mux = self.mux.take().expect("RawRunner::spawn called twice");
        let rx = self.mailbox_rx.take().expect("RawRunner::spawn called twice");
        let name = self.name.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let result = match catch_unwind(AssertUnwindSafe(|| block.start(mux, &rx))) {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(block = %name, "raw block panicked during start");
                        Err(GraphError::BlockPanicked(name))
                    }
                };
                (block, result)
            })
            .expect("failed to spawn raw block runner thread");
        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        for closer in &self.closers {
            closer.close();
        }
    }

    pub fn join(&mut self) -> (Option<Box<dyn RawBlock>>, Result<()>) {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok((block, result)) => (Some(block), result),
                Err(_) => (None, Err(GraphError::BlockPanicked(self.name.clone()))),
            },
            None => (None, Ok(())),
        }
    }

    pub fn call(&self, method: &str, args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        send_call(&self.mailbox_tx, &self.name, method, args)
    }
}

/// A joined runner's block, still tagged by which runner kind produced
/// it so the caller can put it back in the arena as the right
/// [`crate::graph::LeafEntry`] variant.
pub enum ReturnedBlock {
    Threaded(Option<Box<dyn Block>>),
    Raw(Option<Box<dyn RawBlock>>),
}

/// The two runner variants the graph owner drives identically.
pub enum BlockRunner {
    Threaded(ThreadedRunner),
    Raw(RawRunner),
}

impl BlockRunner {
    pub fn spawn(&mut self) -> Result<()> {
        match self {
            BlockRunner::Threaded(r) => r.spawn(),
            BlockRunner::Raw(r) => r.spawn(),
        }
    }

    pub fn stop(&mut self) {
        match self {
            BlockRunner::Threaded(r) => r.stop(),
            BlockRunner::Raw(r) => r.stop(),
        }
    }

    pub fn join(&mut self) -> (ReturnedBlock, Result<()>) {
        match self {
            BlockRunner::Threaded(r) => {
                let (block, result) = r.join();
                (ReturnedBlock::Threaded(block), result)
            }
            BlockRunner::Raw(r) => {
                let (block, result) = r.join();
                (ReturnedBlock::Raw(block), result)
            }
        }
    }

    pub fn call(&self, method: &str, args: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        match self {
            BlockRunner::Threaded(r) => r.call(method, args),
            BlockRunner::Raw(r) => r.call(method, args),
        }
    }
}
