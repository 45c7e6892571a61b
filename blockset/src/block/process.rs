use std::io;
use std::process::{ExitStatus, Stdio};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::block::{BlockIo, IoBlock};
use crate::bail;
use crate::blockset_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::connector::{PipeReader, PipeWriter};
use crate::error::{BlockSetResult, ErrorKind};

/// Size of the chunks copied from the upstream pipe into the process input.
const STDIN_CHUNK_SIZE: usize = 8 * 1024;

/// A block backed by an external process.
///
/// The process reads its input on stdin and writes its output on stdout, stderr lines are
/// logged. A block without output leaves stdout to the host. A non-zero exit status fails the
/// block, and the output pipe is only closed once the process exited successfully.
///
/// A stop request closes stdin. A process without input is killed instead, which counts as a
/// clean stop. The process is also killed if the block is aborted.
#[derive(Debug)]
pub struct ProcessBlock {
    name: String,
    command: Command,
    consumer: bool,
    producer: bool,
}

impl ProcessBlock {
    pub fn new(name: impl Into<String>, command: Command, consumer: bool, producer: bool) -> Self {
        Self {
            name: name.into(),
            command,
            consumer,
            producer,
        }
    }

    pub fn extractor(name: impl Into<String>, command: Command) -> Self {
        Self::new(name, command, false, true)
    }

    pub fn transformer(name: impl Into<String>, command: Command) -> Self {
        Self::new(name, command, true, true)
    }

    pub fn loader(name: impl Into<String>, command: Command) -> Self {
        Self::new(name, command, true, false)
    }

    async fn run_process(self, io: BlockIo) -> BlockSetResult<()> {
        let ProcessBlock {
            name, mut command, ..
        } = self;
        let (mut input, mut output, shutdown_rx) = io.into_parts();
        let program = command.as_std().get_program().to_string_lossy().into_owned();

        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if output.is_some() {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            blockset_error!(
                ErrorKind::BlockSpawnFailed,
                "Block process could not be spawned",
                format!("block '{name}' failed to start `{program}`"),
                source: err
            )
        })?;

        info!(pid = child.id(), program = %program, "block process spawned");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // The exit is awaited next to the output copies, a process may exit while its
        // upstream is still idle.
        let exit = wait_for_exit(&mut child, input.as_mut(), stdin, shutdown_rx);
        let relay = async {
            tokio::try_join!(drain_stdout(stdout, output.as_mut()), log_stderr(stderr))
        };
        let (exit, _) = tokio::try_join!(exit, relay)?;

        // The upstream block only sees its output closed once the exit status is known.
        drop(input);

        match exit {
            ProcessExit::Exited(status) if !status.success() => {
                bail!(
                    ErrorKind::BlockExitStatus,
                    "Block process exited unsuccessfully",
                    format!("block '{name}' running `{program}` exited with {status}")
                );
            }
            ProcessExit::Exited(status) => debug!(%status, "block process exited"),
            ProcessExit::Stopped(status) => {
                debug!(%status, "block process killed after a stop request")
            }
        }

        if let Some(output) = output.as_mut() {
            output.shutdown().await?;
        }

        Ok(())
    }
}

impl IoBlock for ProcessBlock {
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
        self.run_process(io).boxed()
    }
}

/// How the process of a block ended.
#[derive(Debug)]
enum ProcessExit {
    Exited(ExitStatus),
    /// Killed after a stop request since it had no input to close.
    Stopped(ExitStatus),
}

/// Waits for the process to exit, feeding it its input meanwhile.
async fn wait_for_exit(
    child: &mut Child,
    input: Option<&mut PipeReader>,
    stdin: Option<ChildStdin>,
    mut shutdown_rx: ShutdownRx,
) -> BlockSetResult<ProcessExit> {
    if let (Some(input), Some(stdin)) = (input, stdin) {
        tokio::select! {
            fed = feed_stdin(input, stdin, shutdown_rx) => fed?,
            status = child.wait() => return Ok(ProcessExit::Exited(status?)),
        }

        return Ok(ProcessExit::Exited(child.wait().await?));
    }

    tokio::select! {
        _ = shutdown_rx.requested() => {}
        status = child.wait() => return Ok(ProcessExit::Exited(status?)),
    }

    debug!("stop requested, killing block process");
    child.start_kill()?;

    Ok(ProcessExit::Stopped(child.wait().await?))
}

/// Copies the upstream pipe into the process stdin until end of stream or a stop request.
///
/// Closing stdin is how the process learns that no more input is coming. A process exiting
/// without reading all of its input is not an error here, its exit status decides.
async fn feed_stdin(
    input: &mut PipeReader,
    mut stdin: ChildStdin,
    mut shutdown_rx: ShutdownRx,
) -> BlockSetResult<()> {
    let mut buf = vec![0; STDIN_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;

            _ = shutdown_rx.requested() => {
                debug!("stop requested, closing process input");
                break;
            }
            read = input.read(&mut buf) => read?,
        };

        if read == 0 {
            break;
        }

        if let Err(err) = stdin.write_all(&buf[..read]).await {
            if err.kind() == io::ErrorKind::BrokenPipe {
                debug!("process closed its input early");
                break;
            }

            return Err(err.into());
        }
    }

    Ok(())
}

/// Copies the process stdout into the downstream pipe until the process closes it.
async fn drain_stdout(
    stdout: Option<ChildStdout>,
    output: Option<&mut PipeWriter>,
) -> BlockSetResult<()> {
    let (Some(mut stdout), Some(output)) = (stdout, output) else {
        return Ok(());
    };

    let copied = tokio::io::copy(&mut stdout, output).await?;

    debug!(bytes = copied, "process output drained");

    Ok(())
}

async fn log_stderr(stderr: Option<ChildStderr>) -> BlockSetResult<()> {
    let Some(stderr) = stderr else {
        return Ok(());
    };

    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        info!(target: "blockset::process", "{line}");
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::connector::PipeConnector;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn process_output_reaches_downstream_pipe() {
        let poison = CancellationToken::new();
        let mut pipe = PipeConnector::new("echo", "test", 1024, &poison);
        let mut reader = pipe.take_reader().unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let block = Box::new(ProcessBlock::extractor("echo", sh("printf 'a\\nb\\n'")));
        let io = BlockIo::new(None, pipe.take_writer(), shutdown_rx);

        let (result, received) = tokio::join!(block.run(io), async move {
            let mut received = String::new();
            reader.read_to_string(&mut received).await.unwrap();
            received
        });

        result.unwrap();
        assert_eq!(received, "a\nb\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_block() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let block = Box::new(ProcessBlock::new("broken", sh("exit 3"), false, false));

        let err = block
            .run(BlockIo::new(None, None, shutdown_rx))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BlockExitStatus);
        assert!(err.detail().unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let block = Box::new(ProcessBlock::new(
            "ghost",
            Command::new("/nonexistent/blockset-test-binary"),
            false,
            false,
        ));

        let err = block
            .run(BlockIo::new(None, None, shutdown_rx))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BlockSpawnFailed);
    }

    #[tokio::test]
    async fn stop_request_closes_process_input() {
        let poison = CancellationToken::new();
        let mut pipe = PipeConnector::new("test", "cat", 1024, &poison);
        // Keep the writer open so only the stop request can end the input.
        let _writer = pipe.take_writer().unwrap();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let block = Box::new(ProcessBlock::loader("cat", sh("cat > /dev/null")));
        let run = tokio::spawn(block.run(BlockIo::new(pipe.take_reader(), None, shutdown_rx)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.shutdown();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("process did not exit after its input was closed")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_request_kills_process_without_input() {
        let poison = CancellationToken::new();
        let mut pipe = PipeConnector::new("sleeper", "test", 1024, &poison);
        let mut reader = pipe.take_reader().unwrap();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let block = Box::new(ProcessBlock::extractor("sleeper", sh("sleep 600")));
        let run = tokio::spawn(block.run(BlockIo::new(None, pipe.take_writer(), shutdown_rx)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.shutdown();

        timeout(Duration::from_secs(5), run)
            .await
            .expect("process was not stopped")
            .unwrap()
            .unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn exit_is_noticed_while_upstream_is_idle() {
        let poison = CancellationToken::new();
        let mut pipe = PipeConnector::new("test", "quitter", 1024, &poison);
        let _writer = pipe.take_writer().unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let block = Box::new(ProcessBlock::loader("quitter", sh("exit 3")));

        let err = timeout(
            Duration::from_secs(5),
            block.run(BlockIo::new(pipe.take_reader(), None, shutdown_rx)),
        )
        .await
        .expect("process exit was not noticed")
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BlockExitStatus);
    }

    #[tokio::test]
    async fn failed_process_leaves_its_output_open() {
        let poison = CancellationToken::new();
        let mut pipe = PipeConnector::new("partial", "test", 1024, &poison);
        let mut reader = pipe.take_reader().unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let block = Box::new(ProcessBlock::extractor("partial", sh("printf abc; exit 2")));

        let err = block
            .run(BlockIo::new(None, pipe.take_writer(), shutdown_rx))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BlockExitStatus);

        let mut received = [0; 3];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"abc");

        let mut rest = Vec::new();
        let pending = timeout(Duration::from_millis(50), reader.read_to_end(&mut rest)).await;
        assert!(pending.is_err());
    }
}
