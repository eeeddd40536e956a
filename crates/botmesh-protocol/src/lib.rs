//! botmesh protocol - canonical message model and wire bridge
//!
//! Bots speak one event protocol in two dialects (inline-directive strings
//! and structured segment lists). This crate normalizes both into
//! [`InternalMessage`] and back, and defines the action, response and
//! worker-announcement frames the gateway exchanges with its peers.

pub mod bridge;
pub mod constants;
pub mod cqcode;
pub mod error;
pub mod frames;
pub mod identity;
pub mod message;
pub mod params;
pub mod queue;

pub use bridge::{detect_dialect, from_wire, to_wire, Dialect};
pub use constants::*;
pub use error::*;
pub use frames::*;
pub use identity::{IdentityDirectory, IdentityResolver, MemoryIdentityDirectory};
pub use message::*;
pub use params::{ActionParams, RoutingHints, TypedAction};
pub use queue::{EntryKind, QueueEntry};
