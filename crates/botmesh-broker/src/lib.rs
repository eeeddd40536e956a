//! botmesh broker - partitioned logs with consumer groups
//!
//! The gateway's durable queue. [`LogBroker`] is the contract the consumer
//! and the dispatcher program against; [`MemoryBroker`] implements it in
//! process with an optional JSON-lines journal for restarts.

pub mod error;
pub mod journal;
pub mod log;
pub mod memory;

pub use error::*;
pub use log::*;
pub use memory::MemoryBroker;
