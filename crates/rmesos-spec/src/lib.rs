//! Message types shared between the rmesos agent and frameworks.
//!
//! These are the wire-level records the agent exchanges with schedulers and
//! hands to its containerizers: task and executor descriptions, container
//! configuration, resource allocations, and the termination message produced
//! when a container is torn down.

mod types;

pub use types::*;
