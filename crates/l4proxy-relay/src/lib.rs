//! Connection pairing and relay engine
//!
//! This crate implements the broker side of the reverse tunnel. Each registered
//! agent gets an [`AgentInstance`] with two listeners: a public one for users
//! and an internal one the agent dials back on. The two connections are matched
//! by a [`Token`](l4proxy_proto::Token) and spliced by a [`PairedConn`].

mod forwarder;
mod instance;
mod paired;
mod registry;

pub use forwarder::{ForwarderConfig, TcpForwarder};
pub use instance::{AgentInstance, InstanceConfig, RelayError};
pub use paired::{OnClose, PairError, PairedConn, SessionState};
pub use registry::SessionRegistry;
