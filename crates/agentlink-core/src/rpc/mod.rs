//! JSON-RPC plumbing between the client and the worker
//!
//! # Architecture
//!
//! - `framing` - Content-Length / newline framing over raw bytes
//! - `protocol` - Envelope classification and error responses
//! - `transport` - Writer task plus inbound envelope stream
//! - `dispatcher` - Call correlation, timeouts, cancellation, inbound routing
//! - `handler` - Handler traits and the per-method registry

mod dispatcher;
pub mod framing;
mod handler;
mod protocol;
mod transport;

pub use dispatcher::{CallCanceller, CallHandle, DisconnectReason, Dispatcher};
pub use framing::{Framing, DEFAULT_MAX_FRAME_BYTES};
pub use handler::{
    notification_fn, request_fn, typed_notification, typed_request, HandlerRegistry,
    NotificationHandler, RequestHandler,
};
pub use protocol::{
    create_error_response, create_method_not_found_response,
    parse_envelope, parse_message,
};
pub use transport::{EnvelopeStream, Transport, TransportConfig, TransportSender};
