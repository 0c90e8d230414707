//! Control plane for the reverse tunnel broker
//!
//! [`ControlPlane`] owns every registered [`AgentInstance`](l4proxy_relay::AgentInstance)
//! by name. [`ControlServer`] exposes it over TCP using the framed
//! [`ControlMessage`](l4proxy_proto::ControlMessage) protocol: one RPC per
//! connection, selected by the first frame.

pub mod error;
pub mod plane;
pub mod server;

pub use error::ControlError;
pub use plane::{ControlPlane, ControlPlaneConfig, Registration};
pub use server::ControlServer;
