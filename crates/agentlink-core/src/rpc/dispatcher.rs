//! Request/response correlation and inbound routing for one worker generation

use super::handler::{HandlerRegistry, NotificationHandler, RequestHandler};
use super::protocol::{create_error_response, create_method_not_found_response};
use super::transport::{EnvelopeStream, TransportSender};
use crate::error::{RpcError, TransportError};
use crate::types::methods::{encode_params, CancelRequest};
use crate::types::{
    error_codes, CancelParams, CorrelationId, Envelope, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, NotificationMethod,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

type CallOutcome = Result<Value, RpcError>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallOutcome>,
}

struct DispatchState {
    pending: HashMap<u64, PendingCall>,
    handlers: HandlerRegistry,
    closed: bool,
}

/// Why a dispatch loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The worker closed its output stream
    Closed,
    Io(String),
    /// A frame could not be decoded; the stream is no longer trustworthy
    Decode(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "stream closed"),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

/// Correlates outgoing calls with responses and routes worker-initiated
/// messages to registered handlers.
///
/// One dispatcher serves exactly one worker generation. Once its loop ends
/// (or [`Dispatcher::fail_all`] runs) the pending table is closed for good
/// and every later call fails with `ConnectionLost`.
pub struct Dispatcher {
    generation: u64,
    sender: TransportSender,
    next_seq: AtomicU64,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(generation: u64, sender: TransportSender, handlers: HandlerRegistry) -> Self {
        Self {
            generation,
            sender,
            next_seq: AtomicU64::new(1),
            state: Mutex::new(DispatchState {
                pending: HashMap::new(),
                handlers,
                closed: false,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn connection_lost(&self) -> RpcError {
        RpcError::ConnectionLost {
            generation: self.generation,
        }
    }

    /// Send a request and wait for its outcome
    pub async fn call(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.start_call(method, params, timeout).await?.wait().await
    }

    /// Send a request and return a handle to await or cancel it
    pub async fn start_call(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<CallHandle, RpcError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = CorrelationId::new(self.generation, seq);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.connection_lost());
            }
            state.pending.insert(
                seq,
                PendingCall {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        // From here on the handle owns cleanup of the pending entry
        let mut handle = CallHandle {
            dispatcher: Arc::clone(self),
            id,
            method: method.to_string(),
            timeout,
            rx,
            sent: false,
            finished: false,
        };

        debug!("Sending request {} method={}", id, method);
        let request = JsonRpcRequest::new(id.to_wire(), method, params);
        self.sender.send(&request.into()).await?;
        handle.sent = true;

        Ok(handle)
    }

    /// Send a notification. Nothing is awaited beyond the write queue.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.connection_lost());
        }
        debug!("Sending notification {}", method);
        let notification = JsonRpcNotification::new(method, params);
        self.sender.send(&notification.into()).await?;
        Ok(())
    }

    pub fn register_request_handler(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.state.lock().handlers.insert_request(method, handler);
    }

    pub fn register_notification_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        self.state.lock().handlers.insert_notification(method, handler);
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.state.lock().handlers.remove(method)
    }

    fn take_pending(&self, seq: u64) -> Option<PendingCall> {
        self.state.lock().pending.remove(&seq)
    }

    /// Cancel an in-flight call. The waiter sees `RpcError::Cancelled` and
    /// the worker is told via `$/cancelRequest`. Returns false when the call
    /// had already completed.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        if id.generation != self.generation {
            return false;
        }
        let Some(call) = self.take_pending(id.seq) else {
            return false;
        };

        debug!("Cancelling request {} ({})", id, call.method);
        let _ = call.tx.send(Err(RpcError::Cancelled));
        self.send_cancel_notice(id);
        true
    }

    fn send_cancel_notice(&self, id: CorrelationId) {
        let params = CancelParams { id: id.to_wire() };
        let notification = match encode_params(&params) {
            Ok(params) => JsonRpcNotification::new(CancelRequest::METHOD, params),
            Err(e) => {
                warn!("Failed to encode cancel notice for {}: {}", id, e);
                return;
            }
        };
        if let Err(e) = self.sender.try_send(&notification.into()) {
            debug!("Cancel notice for {} not sent: {}", id, e);
        }
    }

    /// Fail every pending call with `ConnectionLost` and refuse new ones.
    /// Returns how many calls were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        for call in drained {
            trace!("Failing pending {} for generation {}", call.method, self.generation);
            let _ = call.tx.send(Err(self.connection_lost()));
        }
        count
    }

    /// Consume the inbound stream until it ends. Always closes the pending
    /// table before returning.
    pub async fn run(&self, mut stream: EnvelopeStream) -> DisconnectReason {
        debug!("Dispatch loop started for generation {}", self.generation);

        let reason = loop {
            match stream.next().await {
                None => break DisconnectReason::Closed,
                Some(Ok(envelope)) => self.dispatch(envelope),
                Some(Err(TransportError::Decode(e))) => {
                    error!("Protocol decode error from worker: {}", e);
                    break DisconnectReason::Decode(e);
                }
                Some(Err(e)) => {
                    error!("Worker stream failed: {}", e);
                    break DisconnectReason::Io(e.to_string());
                }
            }
        };

        let failed = self.fail_all();
        if failed > 0 {
            warn!(
                "Failed {} pending request(s) of generation {}",
                failed, self.generation
            );
        }
        info!(
            "Dispatch loop for generation {} ended: {}",
            self.generation, reason
        );
        reason
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) => self.handle_response(response),
            Envelope::Request(request) => self.handle_request(request),
            Envelope::Notification(notification) => self.handle_notification(notification),
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = CorrelationId::from_wire(&response.id) else {
            warn!("Received response with foreign id: {}", response.id);
            return;
        };
        if id.generation != self.generation {
            debug!(
                "Ignoring response {} addressed to generation {}",
                id, id.generation
            );
            return;
        }

        match self.take_pending(id.seq) {
            Some(call) => {
                trace!("Delivering response for {} ({})", id, call.method);
                let outcome = response.into_result().map_err(RpcError::Remote);
                let _ = call.tx.send(outcome);
            }
            // Late, cancelled or timed out
            None => warn!("Received response for unknown request: {}", id),
        }
    }

    fn handle_request(&self, request: JsonRpcRequest) {
        let handler = self.state.lock().handlers.request(&request.method);
        let sender = self.sender.clone();

        tokio::spawn(async move {
            let JsonRpcRequest {
                id, method, params, ..
            } = request;

            let response = match handler {
                None => {
                    warn!("No handler for worker request: {}", method);
                    create_method_not_found_response(id, &method)
                }
                Some(handler) => match handler.handle(params).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(RpcError::Remote(e)) => JsonRpcResponse::failure(id, e),
                    Err(e) => {
                        error!("Handler for {} failed: {}", method, e);
                        create_error_response(id, error_codes::INTERNAL_ERROR, &e.to_string())
                    }
                },
            };

            if let Err(e) = sender.send(&response.into()).await {
                error!("Failed to send response for {}: {}", method, e);
            }
        });
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        let handler = self.state.lock().handlers.notification(&notification.method);
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle(notification.params) {
                    warn!("Notification handler for {} failed: {}", notification.method, e);
                }
            }
            None if notification.method.starts_with("$/") => {
                trace!("Ignoring notification {}", notification.method);
            }
            None => debug!("No handler for notification: {}", notification.method),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("generation", &self.generation)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// An in-flight call.
///
/// Dropping the handle before the call resolves removes it from the pending
/// table and tells the worker to stop working on it.
pub struct CallHandle {
    dispatcher: Arc<Dispatcher>,
    id: CorrelationId,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<CallOutcome>,
    sent: bool,
    finished: bool,
}

impl CallHandle {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            dispatcher: Arc::clone(&self.dispatcher),
            id: self.id,
        }
    }

    /// Wait for the response, the deadline or teardown, whichever comes first
    pub async fn wait(mut self) -> Result<Value, RpcError> {
        let waited = tokio::time::timeout(self.timeout, &mut self.rx).await;
        let outcome = match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.dispatcher.connection_lost()),
            Err(_) => {
                if self.dispatcher.take_pending(self.id.seq).is_some() {
                    warn!(
                        "Request {} ({}) timed out after {:?}",
                        self.id, self.method, self.timeout
                    );
                    self.dispatcher.send_cancel_notice(self.id);
                    Err(RpcError::Timeout {
                        method: self.method.clone(),
                        after: self.timeout,
                    })
                } else {
                    // Resolved at the same moment the deadline fired
                    self.rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(self.dispatcher.connection_lost()))
                }
            }
        };
        self.finished = true;
        outcome
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let removed = self.dispatcher.take_pending(self.id.seq).is_some();
        if removed && self.sent {
            debug!("Request {} ({}) abandoned", self.id, self.method);
            self.dispatcher.send_cancel_notice(self.id);
        }
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}

/// Cancels one call from anywhere
#[derive(Clone)]
pub struct CallCanceller {
    dispatcher: Arc<Dispatcher>,
    id: CorrelationId,
}

impl CallCanceller {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn cancel(&self) -> bool {
        self.dispatcher.cancel(self.id)
    }
}

impl fmt::Debug for CallCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCanceller").field("id", &self.id).finish()
    }
}
