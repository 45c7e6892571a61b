//! Building blocks for block set tests.
//!
//! - [`blocks`] provides in-process blocks with scripted behaviour: emitting, forwarding,
//!   collecting, failing, and ignoring stop requests.
//! - [`notify`] bounds waits on notifications so a broken test fails instead of hanging.

pub mod blocks;
pub mod notify;
