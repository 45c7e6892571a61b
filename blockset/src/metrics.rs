//! Metrics definitions for block set monitoring.

/// Label for the name of a block.
pub const BLOCK_NAME_LABEL: &str = "block_name";

/// Label for the name of the block writing into a pipe.
pub const UPSTREAM_BLOCK_LABEL: &str = "upstream_block";

/// Label for the outcome of a block or a run.
pub const OUTCOME_LABEL: &str = "outcome";

/// Counter for finished blocks, labelled by outcome.
pub const BLOCKSET_BLOCK_OUTCOMES_TOTAL: &str = "blockset_block_outcomes_total";

/// Histogram of block set run durations in seconds, labelled by outcome.
pub const BLOCKSET_RUN_DURATION_SECONDS: &str = "blockset_run_duration_seconds";

/// Counter for bytes moved through pipes.
pub const BLOCKSET_PIPE_BYTES_TOTAL: &str = "blockset_pipe_bytes_total";

/// Counter for blocks aborted after not draining within the grace period.
pub const BLOCKSET_GRACE_PERIOD_ESCALATIONS_TOTAL: &str = "blockset_grace_period_escalations_total";
