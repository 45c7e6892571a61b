//! Concurrency primitives used to coordinate the blocks of a set.
//!
//! - [`shutdown`] carries graceful stop requests from the coordinator to a block.
//! - [`signal`] lets the coordinator observe that a block task has finished, whether it
//!   returned or was aborted.
//!
//! Forceful termination does not go through these channels: it poisons the pipes (see
//! [`crate::connector`]) and aborts the block tasks.

pub mod shutdown;
pub mod signal;
