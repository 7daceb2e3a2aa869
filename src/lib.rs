//! uproxy - user-space IP packet router
//!
//! Reads raw IP packets from a TUN interface and a UDP tunnel, classifies
//! each one against an ordered policy table and forwards it to a sink, the
//! UDP tunnel, the local interface or a stateful TCP/UDP proxy.

pub mod config;
pub mod dataplane;
pub mod device;
pub mod error;
pub mod packet;
pub mod telemetry;

pub use error::{Error, Result};
