use std::fmt;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::block::{BlockIo, IoBlock};
use crate::error::BlockSetResult;

/// A block running an async closure inside the process.
///
/// ```no_run
/// use blockset::block::TaskBlock;
/// use tokio::io::AsyncWriteExt;
///
/// let extractor = TaskBlock::extractor("numbers", |mut io| async move {
///     if let Some(mut output) = io.take_output() {
///         output.write_all(b"1\n2\n3\n").await?;
///         output.shutdown().await?;
///     }
///     Ok::<_, blockset::error::BlockSetError>(())
/// });
/// ```
pub struct TaskBlock<F> {
    name: String,
    consumer: bool,
    producer: bool,
    body: F,
}

impl<F, Fut> TaskBlock<F>
where
    F: FnOnce(BlockIo) -> Fut + Send + 'static,
    Fut: Future<Output = BlockSetResult<()>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, consumer: bool, producer: bool, body: F) -> Self {
        Self {
            name: name.into(),
            consumer,
            producer,
            body,
        }
    }

    /// A block that only writes an output stream.
    pub fn extractor(name: impl Into<String>, body: F) -> Self {
        Self::new(name, false, true, body)
    }

    /// A block that reads an input stream and writes an output stream.
    pub fn transformer(name: impl Into<String>, body: F) -> Self {
        Self::new(name, true, true, body)
    }

    /// A block that only reads an input stream.
    pub fn loader(name: impl Into<String>, body: F) -> Self {
        Self::new(name, true, false, body)
    }
}

impl<F, Fut> IoBlock for TaskBlock<F>
where
    F: FnOnce(BlockIo) -> Fut + Send + 'static,
    Fut: Future<Output = BlockSetResult<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_consumer(&self) -> bool {
        self.consumer
    }

    fn is_producer(&self) -> bool {
        self.producer
    }

    fn run(self: Box<Self>, io: BlockIo) -> BoxFuture<'static, BlockSetResult<()>> {
        (self.body)(io).boxed()
    }
}

impl<F> fmt::Debug for TaskBlock<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBlock")
            .field("name", &self.name)
            .field("consumer", &self.consumer)
            .field("producer", &self.producer)
            .finish_non_exhaustive()
    }
}
