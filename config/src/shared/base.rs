use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Pipe buffers must be able to hold at least one byte, otherwise no data can flow.
    #[error("`pipe_buffer_size` cannot be zero")]
    PipeBufferSizeZero,
    /// A zero grace period would make every graceful termination forceful.
    #[error("`grace_period_ms` cannot be zero")]
    GracePeriodZero,
}
