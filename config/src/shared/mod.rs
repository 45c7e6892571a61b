//! Shared configuration types for block sets.

mod base;
mod block_set;

pub use base::ValidationError;
pub use block_set::BlockSetConfig;
