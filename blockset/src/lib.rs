//! Coordinates a set of concurrently running blocks wired into a pipeline.
//!
//! Blocks ([`block::IoBlock`]) are connected by bounded byte pipes ([`connector`]), run
//! together by a [`set::BlockSet`] such as [`extract_load::ExtractLoadBlocks`], and stop together:
//! the first failure aborts the whole set, and callers can terminate a running set gracefully or
//! forcefully.

pub mod block;
pub mod concurrency;
pub mod connector;
pub mod error;
pub mod extract_load;
mod macros;
pub mod metrics;
pub mod set;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::shared::BlockSetConfig;
