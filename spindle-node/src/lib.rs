//! Operations shipped with the `spindle-node` binary.
//!
//! Worker processes resolve operations by their registered name, so a host
//! and the `spindle-node worker` processes it launches must link the same
//! definitions.

pub mod ops;
