use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Tunables of a block set run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlockSetConfig {
    /// Capacity in bytes of the buffer between two adjacent blocks.
    ///
    /// A producer writing into a full buffer is suspended until its consumer reads.
    ///
    /// Default: 65536 (64 KiB)
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,

    /// Time in milliseconds each block is given to drain after a graceful termination request
    /// before it is aborted.
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl BlockSetConfig {
    pub const DEFAULT_PIPE_BUFFER_SIZE: usize = 64 * 1024;

    pub const DEFAULT_GRACE_PERIOD_MS: u64 = 10_000;

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Validates the block set configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pipe_buffer_size == 0 {
            return Err(ValidationError::PipeBufferSizeZero);
        }

        if self.grace_period_ms == 0 {
            return Err(ValidationError::GracePeriodZero);
        }

        Ok(())
    }
}

impl Default for BlockSetConfig {
    fn default() -> Self {
        Self {
            pipe_buffer_size: Self::DEFAULT_PIPE_BUFFER_SIZE,
            grace_period_ms: Self::DEFAULT_GRACE_PERIOD_MS,
        }
    }
}

fn default_pipe_buffer_size() -> usize {
    BlockSetConfig::DEFAULT_PIPE_BUFFER_SIZE
}

fn default_grace_period_ms() -> u64 {
    BlockSetConfig::DEFAULT_GRACE_PERIOD_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BlockSetConfig::default();
        assert_eq!(config.pipe_buffer_size, 65_536);
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_buffer() {
        let config = BlockSetConfig {
            pipe_buffer_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::PipeBufferSizeZero));
    }

    #[test]
    fn test_validate_zero_grace_period() {
        let config = BlockSetConfig {
            grace_period_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::GracePeriodZero));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: BlockSetConfig = serde_json::from_str(r#"{"grace_period_ms": 250}"#).unwrap();
        assert_eq!(config.pipe_buffer_size, BlockSetConfig::DEFAULT_PIPE_BUFFER_SIZE);
        assert_eq!(config.grace_period_ms, 250);
    }
}
