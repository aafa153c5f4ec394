//! Publish/subscribe fan-out for worker notifications

use crate::error::RpcError;
use crate::rpc::NotificationHandler;
use crate::types::methods::decode_params;
use crate::types::NotificationMethod;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

pub(crate) type Subscriber = Arc<dyn Fn(Option<Value>) -> Result<(), RpcError> + Send + Sync>;

/// Decode `M`'s payload before handing it over; undecodable payloads become handler errors
pub(crate) fn typed_subscriber<M>(handler: impl Fn(M::Params) + Send + Sync + 'static) -> Subscriber
where
    M: NotificationMethod + 'static,
{
    Arc::new(move |params| {
        let params = decode_params::<M::Params>(params)
            .map_err(|e| RpcError::Handler(format!("invalid {} payload: {}", M::METHOD, e)))?;
        handler(params);
        Ok(())
    })
}

/// Handle returned by a subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    method: String,
    id: u64,
}

impl SubscriptionToken {
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Subscribers keyed by notification method.
///
/// Every subscriber of a method sees each notification, in the order the
/// dispatcher received them.
#[derive(Default)]
pub struct NotificationBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<(u64, Subscriber)>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token and whether this is the method's first subscriber
    pub(crate) fn subscribe(&self, method: &str, subscriber: Subscriber) -> (SubscriptionToken, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write();
        let first = !subscribers.contains_key(method);
        subscribers
            .entry(method.to_string())
            .or_default()
            .push((id, subscriber));

        (
            SubscriptionToken {
                method: method.to_string(),
                id,
            },
            first,
        )
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&token.method) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != token.id);
        before != list.len()
    }

    pub fn subscriber_count(&self, method: &str) -> usize {
        self.subscribers
            .read()
            .get(method)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver to every subscriber of `method`. Returns how many were called.
    pub fn publish(&self, method: &str, params: Option<Value>) -> usize {
        // Subscribers may (un)subscribe from inside a callback
        let snapshot: Vec<Subscriber> = self
            .subscribers
            .read()
            .get(method)
            .map(|list| list.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();

        if snapshot.is_empty() {
            trace!("No subscribers for {}", method);
        }
        for subscriber in &snapshot {
            if let Err(e) = subscriber(params.clone()) {
                warn!("Subscriber for {} failed: {}", method, e);
            }
        }
        snapshot.len()
    }
}

/// Routes one method from the dispatcher into the bus
pub(crate) struct BusHandler {
    pub bus: Arc<NotificationBus>,
    pub method: String,
}

impl NotificationHandler for BusHandler {
    fn handle(&self, params: Option<Value>) -> Result<(), RpcError> {
        self.bus.publish(&self.method, params);
        Ok(())
    }
}
