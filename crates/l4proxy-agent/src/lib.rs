//! Agent side of the reverse tunnel
//!
//! An [`Agent`] registers with the broker's control server, then dials back
//! once per announced user and splices the callback connection with a fresh
//! connection to its local target. [`ControlClient`] issues the one-shot
//! listing RPCs.

pub mod agent;
pub mod client;

pub use agent::{Agent, AgentConfig, AgentError};
pub use client::ControlClient;
