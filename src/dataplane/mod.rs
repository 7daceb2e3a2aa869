//! Data plane components
//!
//! Handles packet forwarding: policy classification, the engine that moves
//! packets between devices, and connection tracking for proxied flows.

mod conntrack;
mod engine;
mod policy;

pub use conntrack::{ConnectionTracker, FlowKey, FlowTimeouts, Session};
pub use engine::{Engine, EngineSettings};
pub use policy::{Action, IpCidr, PolicyRule, PolicyTable, PortMatch};
