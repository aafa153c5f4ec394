//! Typed client facade over the supervised worker
//!
//! Feature code talks to [`AgentClient`]: typed operations, validated inputs,
//! caller-oriented errors and notification subscriptions. It never sees
//! transports, generations or correlation ids.

use crate::config::TimeoutConfig;
use crate::error::{ClientError, RpcError};
use crate::rpc::{CallCanceller, CallHandle};
use crate::types::methods::{
    encode_params, AutocompleteExecute, ChatNew, ChatSubmitMessage,
    CommandExecute, ExtensionConfigurationDidChange,
    TextDocumentDidChange, TextDocumentDidClose, TextDocumentDidFocus, TextDocumentDidOpen,
};
use crate::types::{
    AutocompleteParams, AutocompleteResult, ChatSubmitMessageParams, CorrelationId,
    ExecuteCommandParams, ExtensionConfiguration, ExtensionMessage, NotificationMethod,
    ProtocolTextDocument, RequestMethod, WebviewMessage, WorkerStatus,
};
use crate::worker::{typed_subscriber, Connection, SubscriptionToken, Supervisor};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
/// Entry point for feature code. Cheap to clone; all clients of one
/// supervisor share its subscriptions.
#[derive(Clone)]
pub struct AgentClient {
    supervisor: Arc<Supervisor>,
}

impl AgentClient {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn status(&self) -> WorkerStatus {
        self.supervisor.current_status()
    }

    fn timeouts(&self) -> &TimeoutConfig {
        &self.supervisor.config().timeouts
    }

    fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.supervisor.connection().ok_or_else(|| self.unavailable())
    }

    fn unavailable(&self) -> ClientError {
        match self.supervisor.fatal_error() {
            Some(reason) => ClientError::Fatal(reason),
            None => ClientError::Unavailable(format!(
                "worker is {}",
                self.supervisor.current_status()
            )),
        }
    }

    fn map_error(&self, err: RpcError) -> ClientError {
        match err {
            RpcError::ConnectionLost { .. } => match self.supervisor.fatal_error() {
                Some(reason) => ClientError::Fatal(reason),
                None => ClientError::from(err),
            },
            other => ClientError::from(other),
        }
    }

    // ============================================================================
    // Untyped surface
    // ============================================================================

    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let connection = self.connection()?;
        connection
            .dispatcher()
            .call(method, params, timeout)
            .await
            .map_err(|e| self.map_error(e))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let connection = self.connection()?;
        connection
            .dispatcher()
            .notify(method, params)
            .await
            .map_err(|e| self.map_error(e))
    }

    // ============================================================================
    // Typed surface
    // ============================================================================

    pub async fn call_method<M: RequestMethod>(
        &self,
        params: &M::Params,
        timeout: Duration,
    ) -> Result<M::Result, ClientError> {
        let params = encode_params(params).map_err(|e| ClientError::InvalidInput(e.to_string()))?;
        let value = self.call(M::METHOD, params, timeout).await?;
        decode_result::<M::Result>(M::METHOD, value)
    }

    /// Like [`AgentClient::call_method`], but returns a cancellable handle
    pub async fn start_method<M: RequestMethod>(
        &self,
        params: &M::Params,
        timeout: Duration,
    ) -> Result<PendingRequest<M::Result>, ClientError> {
        let params = encode_params(params).map_err(|e| ClientError::InvalidInput(e.to_string()))?;
        let connection = self.connection()?;
        let handle = connection
            .dispatcher()
            .start_call(M::METHOD, params, timeout)
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(PendingRequest {
            client: self.clone(),
            handle,
            method: M::METHOD,
            _result: PhantomData,
        })
    }

    pub async fn notify_method<M: NotificationMethod>(&self, params: &M::Params) -> Result<(), ClientError> {
        let params = encode_params(params).map_err(|e| ClientError::InvalidInput(e.to_string()))?;
        self.notify(M::METHOD, params).await
    }

    /// Open a new chat panel and return its id
    pub async fn chat_new(&self) -> Result<String, ClientError> {
        self.call_method::<ChatNew>(&(), self.timeouts().interactive())
            .await
    }

    pub async fn chat_submit_message(
        &self,
        panel_id: &str,
        message: WebviewMessage,
    ) -> Result<ExtensionMessage, ClientError> {
        require("panel id", panel_id)?;
        if message.command.trim().is_empty() {
            return Err(ClientError::InvalidInput("message command must not be empty".to_string()));
        }

        let params = ChatSubmitMessageParams {
            id: panel_id.to_string(),
            message,
        };
        self.call_method::<ChatSubmitMessage>(&params, self.timeouts().generation())
            .await
    }

    pub async fn autocomplete(&self, params: AutocompleteParams) -> Result<AutocompleteResult, ClientError> {
        require("document uri", &params.uri)?;
        self.call_method::<AutocompleteExecute>(&params, self.timeouts().interactive())
            .await
    }

    /// Autocomplete that the caller may abandon, e.g. when the user keeps typing
    pub async fn autocomplete_cancellable(
        &self,
        params: AutocompleteParams,
    ) -> Result<PendingRequest<AutocompleteResult>, ClientError> {
        require("document uri", &params.uri)?;
        self.start_method::<AutocompleteExecute>(&params, self.timeouts().interactive())
            .await
    }

    pub async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Value, ClientError> {
        require("command", &params.command)?;
        self.call_method::<CommandExecute>(&params, self.timeouts().generation())
            .await
    }

    pub async fn did_open(&self, document: ProtocolTextDocument) -> Result<(), ClientError> {
        require("document uri", &document.uri)?;
        self.notify_method::<TextDocumentDidOpen>(&document).await
    }

    pub async fn did_change(&self, document: ProtocolTextDocument) -> Result<(), ClientError> {
        require("document uri", &document.uri)?;
        self.notify_method::<TextDocumentDidChange>(&document).await
    }

    pub async fn did_focus(&self, document: ProtocolTextDocument) -> Result<(), ClientError> {
        require("document uri", &document.uri)?;
        self.notify_method::<TextDocumentDidFocus>(&document).await
    }

    pub async fn did_close(&self, document: ProtocolTextDocument) -> Result<(), ClientError> {
        require("document uri", &document.uri)?;
        self.notify_method::<TextDocumentDidClose>(&document).await
    }

    pub async fn configuration_did_change(
        &self,
        configuration: ExtensionConfiguration,
    ) -> Result<(), ClientError> {
        require("server endpoint", &configuration.server_endpoint)?;
        self.notify_method::<ExtensionConfigurationDidChange>(&configuration)
            .await
    }

    // ============================================================================
    // Subscriptions
    // ============================================================================

    /// Subscribe to a worker notification. Payloads that fail to decode are
    /// logged and skipped.
    pub fn on_notification<M>(&self, handler: impl Fn(M::Params) + Send + Sync + 'static) -> SubscriptionToken
    where
        M: NotificationMethod + 'static,
    {
        self.supervisor
            .subscribe(M::METHOD, typed_subscriber::<M>(handler))
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.supervisor.unsubscribe(token)
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

/// An in-flight typed request that can be awaited or cancelled
pub struct PendingRequest<T> {
    client: AgentClient,
    handle: CallHandle,
    method: &'static str,
    _result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PendingRequest<T> {
    pub fn id(&self) -> CorrelationId {
        self.handle.id()
    }

    pub fn canceller(&self) -> CallCanceller {
        self.handle.canceller()
    }

    pub fn cancel(&self) -> bool {
        self.handle.canceller().cancel()
    }

    pub async fn wait(self) -> Result<T, ClientError> {
        let Self {
            client,
            handle,
            method,
            ..
        } = self;
        let value = handle.wait().await.map_err(|e| client.map_error(e))?;
        decode_result::<T>(method, value)
    }
}

fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::InvalidResponse {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn require(what: &str, value: &str) -> Result<(), ClientError> {
    if value.trim().is_empty() {
        return Err(ClientError::InvalidInput(format!("{} must not be empty", what)));
    }
    Ok(())
}
