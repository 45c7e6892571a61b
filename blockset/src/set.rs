use std::future::Future;

use crate::error::BlockSetResult;

/// A coordinated collection of blocks executed as one unit.
///
/// Anything that can be validated, run and terminated is a block set, whatever its internal
/// topology. [`crate::extract_load::ExtractLoadBlocks`] is the linear chain implementation.
pub trait BlockSet {
    /// Checks that the set is structurally runnable without starting anything.
    ///
    /// Pure and idempotent: calling it any number of times gives the same answer.
    fn validate_set(&self) -> BlockSetResult<()>;

    /// Runs every block of the set to completion.
    ///
    /// Returns `Ok(())` only if every block succeeded. A set runs at most once.
    fn run(&self) -> impl Future<Output = BlockSetResult<()>> + Send;

    /// Terminates a running set.
    ///
    /// With `graceful`, blocks are asked to drain and aborted only if they do not finish within
    /// the grace period. Otherwise they are aborted right away. The outcome is reported by
    /// [`BlockSet::run`], which fails once a termination was requested. A forceful call while a
    /// graceful termination is underway aborts the remaining blocks, other repeated calls do
    /// nothing.
    fn terminate(&self, graceful: bool) -> impl Future<Output = ()> + Send;
}
