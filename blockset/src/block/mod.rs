//! The unit contract of a block set.
//!
//! A block is one stage of a pipeline: an extractor producing bytes, a transformer consuming
//! and producing bytes, or a loader consuming bytes. The coordinator only needs to know its
//! name, which stream ends it declares, and how to run it.

mod process;
mod task;

use futures::future::BoxFuture;

use crate::concurrency::shutdown::ShutdownRx;
use crate::connector::{PipeReader, PipeWriter};
use crate::error::BlockSetResult;

pub use process::ProcessBlock;
pub use task::TaskBlock;

/// A runnable unit exposing byte stream ends.
///
/// [`IoBlock::run`] consumes the block: a block runs at most once and is dropped when its run
/// future completes or is aborted. Failures are reported through the returned error, the
/// coordinator attaches the block name before surfacing them.
pub trait IoBlock: Send + 'static {
    /// Name identifying the block in logs and errors.
    fn name(&self) -> &str;

    /// Whether the block reads an input stream.
    fn is_consumer(&self) -> bool;

    /// Whether the block writes an output stream.
    fn is_producer(&self) -> bool;

    /// Runs the block until its work is done or it is asked to stop.
    ///
    /// The block must shut down its output when it is done writing, which is how the next block
    /// learns the stream ended. An output dropped without a shutdown only ends the stream once
    /// the block returned, and a failing block poisons the pipes first. On a graceful stop request (see [`BlockIo`]) it should
    /// stop taking new input, flush what it holds and return.
    fn run(self: Box<Self>, io: BlockIo) -> BoxFuture<'static, BlockSetResult<()>>;
}

/// Static description of a block, captured when a set is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub name: String,
    pub consumer: bool,
    pub producer: bool,
}

impl BlockDescriptor {
    pub fn of(block: &dyn IoBlock) -> Self {
        Self {
            name: block.name().to_owned(),
            consumer: block.is_consumer(),
            producer: block.is_producer(),
        }
    }
}

/// Stream ends and stop requests handed to a running block.
///
/// `input` is set when an upstream block feeds this one and `output` when a downstream block
/// reads from it. A block alone in its set receives neither.
#[derive(Debug)]
pub struct BlockIo {
    input: Option<PipeReader>,
    output: Option<PipeWriter>,
    shutdown_rx: ShutdownRx,
}

impl BlockIo {
    pub fn new(
        input: Option<PipeReader>,
        output: Option<PipeWriter>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            input,
            output,
            shutdown_rx,
        }
    }

    pub fn take_input(&mut self) -> Option<PipeReader> {
        self.input.take()
    }

    pub fn take_output(&mut self) -> Option<PipeWriter> {
        self.output.take()
    }

    /// Receiver resolving when the coordinator asks the block to stop gracefully.
    pub fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_rx.clone()
    }

    pub fn into_parts(self) -> (Option<PipeReader>, Option<PipeWriter>, ShutdownRx) {
        (self.input, self.output, self.shutdown_rx)
    }
}
