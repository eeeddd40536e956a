//! botmesh state - who is connected and what is in flight
//!
//! The [`Registry`] owns every live bot and worker handle, the pending
//! request correlations and the observational counters. The
//! [`LivenessMonitor`] sweeps it; the [`Store`] trait is the narrow door to
//! external persistence.

pub mod correlation;
pub mod error;
pub mod link;
pub mod liveness;
pub mod registry;
pub mod stats;
pub mod store;

pub use correlation::{ActionState, PendingCorrelations};
pub use error::StateError;
pub use link::{LinkCommand, PeerLink, LINK_CAPACITY};
pub use liveness::{Eviction, LivenessConfig, LivenessMonitor};
pub use registry::{
    peer_key, BotPeer, BotRoute, BotSummary, PeerKind, Registry, RegistrySnapshot, StalePeer,
    WorkerPeer, WorkerRoute, WorkerSummary,
};
pub use stats::{
    ConnectionStats, DailyCounter, DisconnectReason, SampleWindow, StatScope, TrafficEntry,
    TrafficStats,
};
pub use store::{MemoryStore, Store, StoreIdentityDirectory};
