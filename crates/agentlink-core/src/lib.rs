//! AgentLink Core Library
//!
//! Talks JSON-RPC 2.0 to an out-of-process AI agent worker over its stdio:
//! - Framed transport over any async byte stream
//! - Request/response correlation, timeouts, cancellation and inbound routing
//! - Worker lifecycle supervision with handshake and restart backoff
//! - A typed client facade for chat, autocomplete, commands and documents
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     agentlink-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  client/       - Typed facade, notification subscriptions   │
//! │  worker/       - Launcher, supervisor, restart backoff      │
//! │  rpc/          - Framing, transport, dispatcher, handlers   │
//! │  types/        - Envelopes, payloads, method descriptors    │
//! │  config.rs     - Worker configuration                       │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod rpc;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use error::{ClientError, ConfigError, Error, Result, RpcError, TransportError, WorkerError};
pub use types::*;

pub use client::{AgentClient, PendingRequest};
pub use config::{AgentConfig, ClientSettings, RestartPolicy, TimeoutConfig};
pub use rpc::{
    CallCanceller, CallHandle, DisconnectReason, Dispatcher, Framing, HandlerRegistry,
    NotificationHandler, RequestHandler, Transport, TransportConfig, TransportSender,
};
pub use worker::{
    Connection, ExitInfo, NotificationBus, ProcessLauncher, RestartTracker, SubscriptionToken,
    Supervisor, WorkerLauncher, WorkerProcess, WORKER_LOG_TARGET,
};
