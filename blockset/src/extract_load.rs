//! Linear chain of blocks, from an extractor through transformers to a loader.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use config::shared::BlockSetConfig;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bail;
use crate::block::{BlockDescriptor, BlockIo, IoBlock};
use crate::blockset_error;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::concurrency::signal::{SignalRx, create_signal};
use crate::connector::PipeConnector;
use crate::error::{BlockSetError, BlockSetResult, ErrorKind};
use crate::metrics::{
    BLOCK_NAME_LABEL, BLOCKSET_BLOCK_OUTCOMES_TOTAL, BLOCKSET_GRACE_PERIOD_ESCALATIONS_TOTAL,
    BLOCKSET_RUN_DURATION_SECONDS, OUTCOME_LABEL,
};
use crate::set::BlockSet;

/// How a block of a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Succeeded,
    Failed(ErrorKind),
    /// The block was aborted before it could finish.
    Cancelled,
}

impl BlockOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            BlockOutcome::Succeeded => "succeeded",
            BlockOutcome::Failed(_) => "failed",
            BlockOutcome::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one block, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub name: String,
    pub outcome: BlockOutcome,
}

/// How a caller asked a running set to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    Graceful,
    Forceful,
}

impl fmt::Display for TerminationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationMode::Graceful => f.write_str("gracefully"),
            TerminationMode::Forceful => f.write_str("forcefully"),
        }
    }
}

/// Handles on one spawned block.
#[derive(Debug)]
struct BlockControl {
    name: String,
    shutdown_tx: ShutdownTx,
    abort_handle: AbortHandle,
    done_rx: SignalRx,
}

/// Everything needed to stop a run from outside the task driving it.
#[derive(Debug)]
struct RunControls {
    blocks: Vec<BlockControl>,
    poison: CancellationToken,
    termination: Mutex<Option<TerminationMode>>,
    grace_period: Duration,
}

impl RunControls {
    fn termination(&self) -> Option<TerminationMode> {
        *self.termination.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a termination request, returning whether it changes how the run is stopped.
    ///
    /// A forceful request overrides a graceful one still in progress, anything else after the
    /// first request is ignored.
    fn request_termination(&self, mode: TerminationMode) -> bool {
        let mut termination = self.termination.lock().unwrap_or_else(PoisonError::into_inner);

        match (*termination, mode) {
            (None, _) | (Some(TerminationMode::Graceful), TerminationMode::Forceful) => {
                *termination = Some(mode);
                true
            }
            _ => false,
        }
    }

    /// Whether the run was asked to terminate or had its pipes poisoned.
    fn is_stopping(&self) -> bool {
        self.termination().is_some() || self.poison.is_cancelled()
    }

    /// Poisons every pipe and aborts every block task.
    ///
    /// Blocks suspended on a pipe wake up with a cancellation error, the others are cancelled at
    /// their next suspension point. Blocks that already finished keep their result.
    fn abort_all(&self) {
        self.poison.cancel();
        for block in &self.blocks {
            block.abort_handle.abort();
        }
    }

    /// Asks blocks to stop from the last one to the first, aborting the ones that do not finish
    /// within the grace period.
    async fn terminate_gracefully(&self) {
        for block in self.blocks.iter().rev() {
            if self.poison.is_cancelled() {
                debug!("pipes were poisoned, stopping the graceful termination");
                return;
            }

            if block.done_rx.has_fired() {
                continue;
            }

            debug!(block = %block.name, "requesting block to stop");
            block.shutdown_tx.shutdown();

            let mut done_rx = block.done_rx.clone();
            if timeout(self.grace_period, done_rx.fired()).await.is_err() {
                warn!(
                    block = %block.name,
                    grace_period_ms = self.grace_period.as_millis() as u64,
                    "block did not stop within the grace period, aborting it"
                );

                counter!(
                    BLOCKSET_GRACE_PERIOD_ESCALATIONS_TOTAL,
                    BLOCK_NAME_LABEL => block.name.clone()
                )
                .increment(1);

                block.abort_handle.abort();
            }
        }
    }
}

enum RunPhase {
    Idle(Vec<Box<dyn IoBlock>>),
    Running(Arc<RunControls>),
    /// Terminated before `run` was called.
    Terminated,
    Finished,
}

/// What the supervisor observed while joining the block tasks.
struct Supervision {
    outcomes: Vec<BlockOutcome>,
    /// Block failures in completion order, with the position of the failing block.
    failures: Vec<(usize, BlockSetError)>,
    /// Failures of tasks that could not be traced back to a block.
    unattributed: Vec<BlockSetError>,
}

type BlockTasks = JoinSet<(usize, BlockSetResult<()>)>;

/// Block set running blocks as a linear chain.
///
/// Block `i` writes into a bounded pipe read by block `i + 1`. All blocks run concurrently, the
/// first one failing aborts the others, and [`BlockSet::run`] returns only once every block task
/// is gone.
///
/// A set is single-shot: the blocks are consumed by the first [`BlockSet::run`].
pub struct ExtractLoadBlocks {
    descriptors: Vec<BlockDescriptor>,
    config: BlockSetConfig,
    validated: AtomicBool,
    phase: Mutex<RunPhase>,
    report: OnceLock<Vec<BlockReport>>,
}

impl ExtractLoadBlocks {
    /// Creates a set with the default [`BlockSetConfig`].
    pub fn new(blocks: Vec<Box<dyn IoBlock>>) -> Self {
        Self::with_config(blocks, BlockSetConfig::default())
    }

    /// Creates a set from blocks in pipeline order.
    ///
    /// Nothing is validated or started here, see [`BlockSet::validate_set`].
    pub fn with_config(blocks: Vec<Box<dyn IoBlock>>, config: BlockSetConfig) -> Self {
        let descriptors = blocks
            .iter()
            .map(|block| BlockDescriptor::of(block.as_ref()))
            .collect();

        Self {
            descriptors,
            config,
            validated: AtomicBool::new(false),
            phase: Mutex::new(RunPhase::Idle(blocks)),
            report: OnceLock::new(),
        }
    }

    pub fn blocks(&self) -> &[BlockDescriptor] {
        &self.descriptors
    }

    pub fn config(&self) -> &BlockSetConfig {
        &self.config
    }

    /// Per-block outcomes of the finished run, `None` until a run completed.
    pub fn outcomes(&self) -> Option<&[BlockReport]> {
        self.report.get().map(Vec::as_slice)
    }

    fn lock_phase(&self) -> MutexGuard<'_, RunPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the blocks out of the set, wires them and spawns one task per block.
    fn start(&self) -> BlockSetResult<(BlockTasks, Arc<RunControls>, Vec<PipeConnector>)> {
        let mut phase = self.lock_phase();

        let blocks = match std::mem::replace(&mut *phase, RunPhase::Finished) {
            RunPhase::Idle(blocks) => blocks,
            RunPhase::Running(controls) => {
                *phase = RunPhase::Running(controls);
                bail!(
                    ErrorKind::BlockSetAlreadyRun,
                    "Block set is already running"
                );
            }
            RunPhase::Terminated => {
                *phase = RunPhase::Terminated;
                bail!(
                    ErrorKind::BlockSetTerminated,
                    "Block set was terminated",
                    "the block set was terminated before it started"
                );
            }
            RunPhase::Finished => {
                bail!(
                    ErrorKind::BlockSetAlreadyRun,
                    "Block set already ran",
                    "a block set runs once, build a new one to run the blocks again"
                );
            }
        };

        let poison = CancellationToken::new();
        let mut connectors = blocks
            .windows(2)
            .map(|pair| {
                PipeConnector::new(
                    pair[0].name(),
                    pair[1].name(),
                    self.config.pipe_buffer_size,
                    &poison,
                )
            })
            .collect::<Vec<_>>();

        let mut tasks = JoinSet::new();
        let mut controls = Vec::with_capacity(blocks.len());

        for (position, block) in blocks.into_iter().enumerate() {
            let input = position
                .checked_sub(1)
                .and_then(|upstream| connectors.get_mut(upstream))
                .and_then(PipeConnector::take_reader);
            let (output, end_of_stream) = connectors
                .get_mut(position)
                .map(|connector| {
                    (
                        connector.take_writer(),
                        connector.take_end_of_stream_guard(),
                    )
                })
                .unwrap_or_default();

            let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
            let (done_tx, done_rx) = create_signal();

            let name = block.name().to_owned();
            let span = info_span!("block", block = %name, position);
            let block_future = block.run(BlockIo::new(input, output, shutdown_rx));
            let poison = poison.clone();

            let abort_handle = tasks.spawn(
                async move {
                    info!("block started");

                    let result = AssertUnwindSafe(block_future)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(panic_error(payload)));

                    // The output of a failed block must never reach downstream as a complete
                    // stream.
                    if result
                        .as_ref()
                        .is_err_and(|err| !err.kind().is_pipe_consequence())
                    {
                        poison.cancel();
                    }
                    drop(end_of_stream);

                    let _ = done_tx.send(());

                    (position, result)
                }
                .instrument(span),
            );

            controls.push(BlockControl {
                name,
                shutdown_tx,
                abort_handle,
                done_rx,
            });
        }

        let controls = Arc::new(RunControls {
            blocks: controls,
            poison,
            termination: Mutex::new(None),
            grace_period: self.config.grace_period(),
        });
        *phase = RunPhase::Running(controls.clone());

        Ok((tasks, controls, connectors))
    }

    /// Joins every block task, aborting the others on the first failure.
    async fn supervise(&self, tasks: &mut BlockTasks, controls: &RunControls) -> Supervision {
        let mut supervision = Supervision {
            outcomes: vec![BlockOutcome::Cancelled; self.descriptors.len()],
            failures: Vec::new(),
            unattributed: Vec::new(),
        };
        let mut aborted = false;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, Ok(()))) => {
                    info!(block = %self.descriptors[position].name, "block completed");
                    supervision.outcomes[position] = BlockOutcome::Succeeded;
                }
                Ok((position, Err(err))) => {
                    let name = &self.descriptors[position].name;
                    supervision.outcomes[position] = BlockOutcome::Failed(err.kind());

                    // Once the set is stopping, blocks failing on a pipe a neighbour closed or
                    // the set poisoned are part of the stop.
                    let expected = err.kind().is_pipe_consequence() && controls.is_stopping();

                    if aborted || expected {
                        debug!(block = %name, error = %err, "block failed after the set started stopping");
                    } else {
                        error!(block = %name, error = %err, "block failed, aborting the remaining blocks");
                        controls.abort_all();
                        aborted = true;
                    }

                    supervision.failures.push((position, err));
                }
                Err(err) if err.is_cancelled() => {
                    debug!("block task was aborted");
                }
                Err(err) => {
                    error!(error = %err, "block task failed outside of its block");
                    if !aborted {
                        controls.abort_all();
                        aborted = true;
                    }

                    supervision.unattributed.push(err.into());
                }
            }
        }

        supervision
    }

    /// Turns the supervision of a run into its single result.
    ///
    /// A block failing for its own reasons wins over a termination request, which wins over
    /// blocks failing only because a neighbour closed a pipe.
    fn resolve(
        &self,
        supervision: Supervision,
        termination: Option<TerminationMode>,
    ) -> BlockSetResult<()> {
        let Supervision {
            outcomes,
            mut failures,
            unattributed,
        } = supervision;

        if let Some(index) = failures
            .iter()
            .position(|(_, err)| !err.kind().is_pipe_consequence())
        {
            let (position, err) = failures.swap_remove(index);
            return Err(self.block_failed(position, err));
        }

        if !unattributed.is_empty() {
            return Err(unattributed.into());
        }

        if let Some(mode) = termination {
            bail!(
                ErrorKind::BlockSetTerminated,
                "Block set was terminated",
                format!("the block set was terminated {mode}")
            );
        }

        if let Some((position, err)) = failures.into_iter().next() {
            return Err(self.block_failed(position, err));
        }

        if let Some(position) = outcomes
            .iter()
            .position(|outcome| *outcome == BlockOutcome::Cancelled)
        {
            bail!(
                ErrorKind::BlockCancelled,
                "Block was cancelled",
                format!(
                    "block '{}' at position {position} was cancelled",
                    self.descriptors[position].name
                )
            );
        }

        Ok(())
    }

    fn block_failed(&self, position: usize, err: BlockSetError) -> BlockSetError {
        let name = &self.descriptors[position].name;

        blockset_error!(
            ErrorKind::BlockFailed,
            "Block failed",
            format!(
                "block '{name}' at position {position} failed: {}",
                err.description()
            ),
            source: err
        )
    }

    /// Records the outcome of the run and releases the run controls.
    fn finish(&self, outcomes: &[BlockOutcome]) {
        *self.lock_phase() = RunPhase::Finished;

        let report = self
            .descriptors
            .iter()
            .zip(outcomes)
            .map(|(descriptor, outcome)| BlockReport {
                name: descriptor.name.clone(),
                outcome: *outcome,
            })
            .collect::<Vec<_>>();

        for block in &report {
            counter!(
                BLOCKSET_BLOCK_OUTCOMES_TOTAL,
                BLOCK_NAME_LABEL => block.name.clone(),
                OUTCOME_LABEL => block.outcome.as_str()
            )
            .increment(1);
        }

        let _ = self.report.set(report);
    }

    /// Marks the set as terminating and returns the controls of the run to stop, if any.
    fn begin_termination(&self, mode: TerminationMode) -> Option<Arc<RunControls>> {
        let mut phase = self.lock_phase();

        if matches!(*phase, RunPhase::Idle(_)) {
            info!(%mode, "block set terminated before it started");
            *phase = RunPhase::Terminated;
            return None;
        }

        let RunPhase::Running(controls) = &*phase else {
            debug!("block set is not running, nothing to terminate");
            return None;
        };

        if !controls.request_termination(mode) {
            debug!(%mode, "block set termination already underway");
            return None;
        }

        Some(controls.clone())
    }
}

impl BlockSet for ExtractLoadBlocks {
    fn validate_set(&self) -> BlockSetResult<()> {
        validate_chain(&self.descriptors)?;
        self.config.validate()?;

        self.validated.store(true, Ordering::Release);

        Ok(())
    }

    async fn run(&self) -> BlockSetResult<()> {
        if !self.validated.load(Ordering::Acquire) {
            self.validate_set()?;
        }

        let (mut tasks, controls, connectors) = self.start()?;
        let started_at = Instant::now();

        info!(blocks = self.descriptors.len(), "block set started");

        let supervision = self.supervise(&mut tasks, &controls).await;

        for connector in &connectors {
            connector.report();
        }

        self.finish(&supervision.outcomes);
        let result = self.resolve(supervision, controls.termination());

        let outcome = match &result {
            Ok(()) => "succeeded",
            Err(err) if err.kind() == ErrorKind::BlockSetTerminated => "terminated",
            Err(_) => "failed",
        };
        histogram!(BLOCKSET_RUN_DURATION_SECONDS, OUTCOME_LABEL => outcome)
            .record(started_at.elapsed().as_secs_f64());

        match &result {
            Ok(()) => info!("block set completed"),
            Err(err) => info!(error = %err.description(), detail = err.detail(), "block set ended abnormally"),
        }

        result
    }

    async fn terminate(&self, graceful: bool) {
        let mode = if graceful {
            TerminationMode::Graceful
        } else {
            TerminationMode::Forceful
        };

        let Some(controls) = self.begin_termination(mode) else {
            return;
        };

        info!(%mode, "terminating block set");

        match mode {
            TerminationMode::Graceful => controls.terminate_gracefully().await,
            TerminationMode::Forceful => controls.abort_all(),
        }
    }
}

impl fmt::Debug for ExtractLoadBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractLoadBlocks")
            .field("blocks", &self.descriptors)
            .field("config", &self.config)
            .field("validated", &self.validated.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Checks that adjacent blocks of a chain can be wired together.
///
/// A lone block is always valid since there is nothing to connect.
pub fn validate_chain(blocks: &[BlockDescriptor]) -> BlockSetResult<()> {
    let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
        bail!(
            ErrorKind::EmptyBlockSet,
            "Block set has no blocks",
            "add at least an extractor to the block set"
        );
    };

    if blocks.len() == 1 {
        return Ok(());
    }

    if first.consumer {
        bail!(
            ErrorKind::SourceDeclaresInput,
            "First block of the set declares an input",
            format!(
                "block '{}' starts the set but consumes an input nothing feeds, \
                 put a block producing its input before it or use a block without input",
                first.name
            )
        );
    }

    if last.producer {
        bail!(
            ErrorKind::SinkDeclaresOutput,
            "Last block of the set declares an output",
            format!(
                "block '{}' ends the set but produces an output nothing reads, \
                 put a block consuming its output after it or use a block without output",
                last.name
            )
        );
    }

    for window in blocks.windows(2) {
        let (upstream, downstream) = (&window[0], &window[1]);

        if !upstream.producer {
            bail!(
                ErrorKind::InteriorBlockMissingHandle,
                "Block in the middle of the set declares no output",
                format!(
                    "block '{}' is followed by block '{}' but produces no output",
                    upstream.name, downstream.name
                )
            );
        }

        if !downstream.consumer {
            bail!(
                ErrorKind::InteriorBlockMissingHandle,
                "Block in the middle of the set declares no input",
                format!(
                    "block '{}' follows block '{}' but consumes no input",
                    downstream.name, upstream.name
                )
            );
        }
    }

    Ok(())
}

fn panic_error(payload: Box<dyn Any + Send>) -> BlockSetError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "block panicked with a non-string payload".to_owned());

    blockset_error!(ErrorKind::BlockPanic, "Block panicked", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, consumer: bool, producer: bool) -> BlockDescriptor {
        BlockDescriptor {
            name: name.to_owned(),
            consumer,
            producer,
        }
    }

    fn extractor(name: &str) -> BlockDescriptor {
        descriptor(name, false, true)
    }

    fn transformer(name: &str) -> BlockDescriptor {
        descriptor(name, true, true)
    }

    fn loader(name: &str) -> BlockDescriptor {
        descriptor(name, true, false)
    }

    fn idle_controls() -> RunControls {
        RunControls {
            blocks: Vec::new(),
            poison: CancellationToken::new(),
            termination: Mutex::new(None),
            grace_period: Duration::from_millis(100),
        }
    }

    fn validation_kind(blocks: &[BlockDescriptor]) -> Option<ErrorKind> {
        validate_chain(blocks).err().map(|err| err.kind())
    }

    #[test]
    fn compatible_chains_are_valid() {
        let mut chain = vec![extractor("tap")];
        for length in 0..5 {
            let mut candidate = chain.clone();
            candidate.push(loader("target"));
            assert!(
                validate_chain(&candidate).is_ok(),
                "chain with {length} transformers was rejected"
            );
            chain.push(transformer(&format!("mapper-{length}")));
        }
    }

    #[test]
    fn empty_set_is_invalid() {
        assert_eq!(validation_kind(&[]), Some(ErrorKind::EmptyBlockSet));
    }

    #[test]
    fn lone_block_is_valid_whatever_it_declares() {
        for (consumer, producer) in [(false, false), (true, false), (false, true), (true, true)] {
            assert!(validate_chain(&[descriptor("solo", consumer, producer)]).is_ok());
        }
    }

    #[test]
    fn first_block_declaring_input_is_invalid() {
        let blocks = [transformer("tap"), loader("target")];

        let err = validate_chain(&blocks).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceDeclaresInput);
        assert!(err.kind().is_validation());
        assert!(err.detail().unwrap().contains("'tap'"));
    }

    #[test]
    fn last_block_declaring_output_is_invalid() {
        let blocks = [extractor("tap"), transformer("target")];

        assert_eq!(validation_kind(&blocks), Some(ErrorKind::SinkDeclaresOutput));
    }

    #[test]
    fn interior_block_missing_a_handle_is_invalid() {
        let missing_output = [extractor("tap"), loader("mapper"), loader("target")];
        let missing_input = [extractor("tap"), extractor("mapper"), loader("target")];

        assert_eq!(
            validation_kind(&missing_output),
            Some(ErrorKind::InteriorBlockMissingHandle)
        );
        assert_eq!(
            validation_kind(&missing_input),
            Some(ErrorKind::InteriorBlockMissingHandle)
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let blocks = [extractor("tap"), transformer("target")];

        let first = validation_kind(&blocks);
        let second = validation_kind(&blocks);

        assert_eq!(first, second);
    }

    #[test]
    fn forceful_request_upgrades_graceful_termination() {
        let controls = idle_controls();

        assert!(controls.request_termination(TerminationMode::Graceful));
        assert!(!controls.request_termination(TerminationMode::Graceful));
        assert!(controls.request_termination(TerminationMode::Forceful));
        assert_eq!(controls.termination(), Some(TerminationMode::Forceful));

        assert!(!controls.request_termination(TerminationMode::Forceful));
        assert!(!controls.request_termination(TerminationMode::Graceful));
        assert_eq!(controls.termination(), Some(TerminationMode::Forceful));
    }

    #[test]
    fn set_is_stopping_once_terminated_or_poisoned() {
        let controls = idle_controls();
        assert!(!controls.is_stopping());
        controls.request_termination(TerminationMode::Forceful);
        assert!(controls.is_stopping());

        let controls = idle_controls();
        controls.abort_all();
        assert!(controls.is_stopping());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = panic_error(Box::new("boom"));
        assert_eq!(err.kind(), ErrorKind::BlockPanic);
        assert_eq!(err.detail(), Some("boom"));

        let err = panic_error(Box::new(String::from("bang")));
        assert_eq!(err.detail(), Some("bang"));

        let err = panic_error(Box::new(42));
        assert!(err.detail().unwrap().contains("non-string"));
    }
}
