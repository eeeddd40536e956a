//! botmesh gateway - connects chat bots to workers
//!
//! Bots and workers hold WebSocket connections to the gateway. Inbound bot
//! events are routed to one worker; worker actions are relayed to a bot and
//! answered through echo correlation. When a bot is not reachable locally,
//! the action is appended to the durable log for a peer gateway to deliver.
//! A consumer-group reader handles events and skill calls queued by other
//! services.

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod routing;
pub mod server;
pub mod skills;

pub use config::GatewayConfig;
pub use consumer::{backoff_delay, ConsumerConfig, EntryOutcome, QueueConsumer};
pub use dispatch::{ActionDispatch, DeliveryOutcome, DispatchConfig, Dispatcher};
pub use error::{DispatchError, GatewayError};
pub use gateway::Gateway;
pub use routing::{RoundRobin, RoutingRule, RoutingTable, RulePattern, ROUTING_RULE_ENTITY, ROUTING_RULE_INDEX_ENTITY};
pub use server::{router, AppState};
pub use skills::{FnSkill, SkillHandler, SkillParams, SkillRegistry};
