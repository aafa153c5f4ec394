//! Core type definitions for AgentLink
//!
//! JSON-RPC envelopes, typed protocol payloads and method descriptors, and
//! worker status types.

mod jsonrpc;
pub mod methods;
mod protocol_types;
mod status;

pub use jsonrpc::*;
pub use methods::{NotificationMethod, RequestMethod};
pub use protocol_types::*;
pub use status::*;
