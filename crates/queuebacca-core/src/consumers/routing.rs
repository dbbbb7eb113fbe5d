// Routes messages to registered consumers by hierarchical type key.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::consumers::{ConsumerResult, MessageConsumer};
use crate::error::Error;
use crate::message::MessageContext;

/// A message that can be routed by type key.
///
/// The key is dot-separated, most specific segment last
/// (`"orders.created"`). Aliases play the role of a type's
/// directly-declared interfaces: alternative keys the message also answers
/// to, in declaration order.
pub trait RoutedMessage {
    fn route_key(&self) -> String;

    fn route_aliases(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Routes each message to the consumer registered for its type key,
/// letting several message types share one bin.
///
/// Resolution order: the exact key, then the message's aliases in
/// declaration order, then ancestor keys obtained by trimming trailing
/// `.`-segments. Aliases are consulted only for the message's own key,
/// never for ancestor keys; that asymmetry is part of the routing
/// contract. Resolved routes are memoised, and registering two consumers
/// under one key is refused.
pub struct RoutingMessageConsumer<M> {
    consumers: HashMap<String, Arc<dyn MessageConsumer<M>>>,
    resolved: RwLock<HashMap<String, String>>,
}

impl<M> RoutingMessageConsumer<M>
where
    M: RoutedMessage + Send + 'static,
{
    pub fn builder() -> RoutingMessageConsumerBuilder<M> {
        RoutingMessageConsumerBuilder {
            consumers: HashMap::new(),
        }
    }

    /// How many distinct keys have been resolved so far. A repeat delivery
    /// of an already-routed key leaves this unchanged.
    pub fn resolved_route_count(&self) -> usize {
        self.resolved.read().expect("route cache lock").len()
    }

    fn find_consumer(&self, message: &M) -> Option<&Arc<dyn MessageConsumer<M>>> {
        let key = message.route_key();
        if let Some(target) = self.resolved.read().expect("route cache lock").get(&key) {
            return self.consumers.get(target);
        }
        let target = self.map_route(&key, message)?;
        self.resolved
            .write()
            .expect("route cache lock")
            .insert(key, target.clone());
        self.consumers.get(&target)
    }

    fn map_route(&self, key: &str, message: &M) -> Option<String> {
        if self.consumers.contains_key(key) {
            return Some(key.to_string());
        }
        for alias in message.route_aliases() {
            if self.consumers.contains_key(&alias) {
                return Some(alias);
            }
        }
        let mut current = key;
        while let Some((parent, _)) = current.rsplit_once('.') {
            if self.consumers.contains_key(parent) {
                return Some(parent.to_string());
            }
            current = parent;
        }
        None
    }
}

#[async_trait]
impl<M> MessageConsumer<M> for RoutingMessageConsumer<M>
where
    M: RoutedMessage + Send + Sync + 'static,
{
    async fn consume(&self, message: M, context: &MessageContext) -> ConsumerResult {
        let Some(consumer) = self.find_consumer(&message) else {
            return Err(anyhow::Error::new(Error::Configuration(format!(
                "no consumer registered for message '{}'",
                message.route_key()
            ))));
        };
        consumer.consume(message, context).await
    }
}

pub struct RoutingMessageConsumerBuilder<M> {
    consumers: HashMap<String, Arc<dyn MessageConsumer<M>>>,
}

impl<M> std::fmt::Debug for RoutingMessageConsumerBuilder<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingMessageConsumerBuilder")
            .field("consumers", &self.consumers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<M> RoutingMessageConsumerBuilder<M>
where
    M: RoutedMessage + Send + 'static,
{
    /// Register a consumer for a route key. Refuses duplicates.
    pub fn register_route(
        mut self,
        key: impl Into<String>,
        consumer: impl MessageConsumer<M> + 'static,
    ) -> Result<Self, Error> {
        let key = key.into();
        if self.consumers.contains_key(&key) {
            return Err(Error::Configuration(format!(
                "a consumer for route '{key}' is already registered"
            )));
        }
        self.consumers.insert(key, Arc::new(consumer));
        Ok(self)
    }

    pub fn build(self) -> RoutingMessageConsumer<M> {
        RoutingMessageConsumer {
            consumers: self.consumers,
            resolved: RwLock::new(HashMap::new()),
        }
    }
}
