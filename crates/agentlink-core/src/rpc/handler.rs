//! Handlers for worker-initiated requests and notifications

use crate::error::RpcError;
use crate::types::methods::decode_params;
use crate::types::{error_codes, NotificationMethod, RequestMethod, ResponseError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Answers a request sent by the worker.
///
/// Returning `RpcError::Remote` sends that exact error object back; any other
/// error becomes an internal error (`-32603`) response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError>;
}

/// Consumes a notification sent by the worker. Runs on the dispatch loop, so
/// it must not block.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, params: Option<Value>) -> Result<(), RpcError>;
}

fn invalid_params(method: &str, err: serde_json::Error) -> RpcError {
    RpcError::Remote(
        ResponseError::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params for {}", method),
        )
        .with_data(Value::String(err.to_string())),
    )
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError> {
        (self.0)(params).await
    }
}

/// Wrap an async closure over raw params
pub fn request_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnRequestHandler(f))
}

struct FnNotificationHandler<F>(F);

impl<F> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Option<Value>) -> Result<(), RpcError> + Send + Sync,
{
    fn handle(&self, params: Option<Value>) -> Result<(), RpcError> {
        (self.0)(params)
    }
}

pub fn notification_fn<F>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(Option<Value>) -> Result<(), RpcError> + Send + Sync + 'static,
{
    Arc::new(FnNotificationHandler(f))
}

struct TypedRequestHandler<M, F> {
    f: F,
    _method: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, F, Fut> RequestHandler for TypedRequestHandler<M, F>
where
    M: RequestMethod + 'static,
    F: Fn(M::Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Result, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params = decode_params::<M::Params>(params).map_err(|e| invalid_params(M::METHOD, e))?;
        let result = (self.f)(params).await?;
        serde_json::to_value(result).map_err(|e| RpcError::Handler(e.to_string()))
    }
}

/// Wrap an async closure over the typed params of `M`. Params that do not
/// decode are answered with `-32602`.
pub fn typed_request<M, F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    M: RequestMethod + 'static,
    F: Fn(M::Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Result, RpcError>> + Send + 'static,
{
    Arc::new(TypedRequestHandler::<M, F> {
        f,
        _method: PhantomData,
    })
}

struct TypedNotificationHandler<M, F> {
    f: F,
    _method: PhantomData<fn() -> M>,
}

impl<M, F> NotificationHandler for TypedNotificationHandler<M, F>
where
    M: NotificationMethod + 'static,
    F: Fn(M::Params) + Send + Sync,
{
    fn handle(&self, params: Option<Value>) -> Result<(), RpcError> {
        let params = decode_params::<M::Params>(params).map_err(|e| invalid_params(M::METHOD, e))?;
        (self.f)(params);
        Ok(())
    }
}

pub fn typed_notification<M, F>(f: F) -> Arc<dyn NotificationHandler>
where
    M: NotificationMethod + 'static,
    F: Fn(M::Params) + Send + Sync + 'static,
{
    Arc::new(TypedNotificationHandler::<M, F> {
        f,
        _method: PhantomData,
    })
}

/// Handlers keyed by method name. Last registration for a method wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_request(&mut self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.requests.insert(method.into(), handler);
    }

    pub fn insert_notification(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        self.notifications.insert(method.into(), handler);
    }

    /// Remove every handler for `method`. Returns whether anything was removed.
    pub fn remove(&mut self, method: &str) -> bool {
        let request = self.requests.remove(method).is_some();
        let notification = self.notifications.remove(method).is_some();
        request || notification
    }

    pub fn request(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests.get(method).cloned()
    }

    pub fn notification(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications.get(method).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.notifications.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("notifications", &self.notifications.keys().collect::<Vec<_>>())
            .finish()
    }
}
