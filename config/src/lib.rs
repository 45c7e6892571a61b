//! Configuration for block sets.
//!
//! Holds the tunables of the block-set coordinator together with the hierarchical loader
//! used by binaries that run block sets.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{LoadConfigError, load_config_from};
