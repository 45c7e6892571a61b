//! In-process blocks with scripted behaviour.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::block::{BlockIo, IoBlock, TaskBlock};
use crate::bail;
use crate::error::{BlockSetResult, ErrorKind};
use crate::test_utils::notify::TimedNotify;

const CHUNK_SIZE: usize = 1024;

/// Bytes received by a collecting loader, shared with the test.
#[derive(Debug, Clone, Default)]
pub struct Collected(Arc<Mutex<Vec<u8>>>);

impl Collected {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&self, bytes: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(bytes);
    }
}

/// Extractor writing `payload` then ending its output.
pub fn emitting_extractor(name: &str, payload: impl Into<Vec<u8>>) -> Box<dyn IoBlock> {
    let payload = payload.into();
    Box::new(TaskBlock::extractor(name, move |io| emit(io, payload)))
}

/// Extractor writing until it is asked to stop, notifying `started` after its first write.
pub fn endless_extractor(name: &str, started: TimedNotify) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::extractor(name, move |io| {
        emit_until_stopped(io, started)
    }))
}

/// Extractor keeping its output open without writing until it is asked to stop.
pub fn stalling_extractor(name: &str) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::extractor(name, stall))
}

/// Transformer copying its input to its output.
pub fn passthrough_transformer(name: &str) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::transformer(name, forward))
}

/// Transformer forwarding `forwarded` bytes and then failing.
pub fn failing_transformer(name: &str, forwarded: usize) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::transformer(name, move |io| {
        forward_then_fail(io, forwarded)
    }))
}

/// Transformer panicking as soon as it runs.
pub fn panicking_transformer(name: &str) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::transformer(name, explode))
}

/// Loader reading its input into a [`Collected`] until end of stream or a stop request.
pub fn collecting_loader(name: &str) -> (Box<dyn IoBlock>, Collected) {
    let collected = Collected::default();
    let block = {
        let collected = collected.clone();
        TaskBlock::loader(name, move |io| collect(io, collected))
    };

    (Box::new(block), collected)
}

/// Loader never reading its input and returning only when asked to stop.
pub fn stalling_loader(name: &str) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::loader(name, stall))
}

/// Loader never reading its input and ignoring stop requests, only an abort ends it.
pub fn stubborn_loader(name: &str) -> Box<dyn IoBlock> {
    Box::new(TaskBlock::loader(name, ignore_stop))
}

async fn emit(mut io: BlockIo, payload: Vec<u8>) -> BlockSetResult<()> {
    if let Some(mut output) = io.take_output() {
        output.write_all(&payload).await?;
        output.shutdown().await?;
    }

    Ok(())
}

async fn emit_until_stopped(mut io: BlockIo, started: TimedNotify) -> BlockSetResult<()> {
    let mut shutdown_rx = io.shutdown_rx();
    let Some(mut output) = io.take_output() else {
        return Ok(());
    };

    let chunk = [b'x'; CHUNK_SIZE];
    let mut notified = false;
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.requested() => break,
            written = output.write_all(&chunk) => written?,
        }

        if !notified {
            started.inner().notify_one();
            notified = true;
        }
    }

    output.shutdown().await?;

    Ok(())
}

async fn forward(mut io: BlockIo) -> BlockSetResult<()> {
    let (Some(mut input), Some(mut output)) = (io.take_input(), io.take_output()) else {
        return Ok(());
    };

    tokio::io::copy(&mut input, &mut output).await?;
    output.shutdown().await?;

    Ok(())
}

async fn forward_then_fail(mut io: BlockIo, forwarded: usize) -> BlockSetResult<()> {
    if let (Some(mut input), Some(mut output)) = (io.take_input(), io.take_output()) {
        let mut buf = vec![0; forwarded];
        input.read_exact(&mut buf).await?;
        output.write_all(&buf).await?;
    }

    bail!(
        ErrorKind::Unknown,
        "Injected block failure",
        format!("failed after forwarding {forwarded} bytes")
    );
}

async fn collect(mut io: BlockIo, collected: Collected) -> BlockSetResult<()> {
    let mut shutdown_rx = io.shutdown_rx();
    let Some(mut input) = io.take_input() else {
        return Ok(());
    };

    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;

            _ = shutdown_rx.requested() => break,
            read = input.read(&mut buf) => read?,
        };

        if read == 0 {
            break;
        }

        collected.extend(&buf[..read]);
    }

    Ok(())
}

async fn stall(io: BlockIo) -> BlockSetResult<()> {
    let mut shutdown_rx = io.shutdown_rx();
    shutdown_rx.requested().await;

    Ok(())
}

async fn ignore_stop(_io: BlockIo) -> BlockSetResult<()> {
    futures::future::pending().await
}

async fn explode(_io: BlockIo) -> BlockSetResult<()> {
    panic!("transformer exploded");
}
