// Chain-of-responsibility pre-processing around a terminal consumer.
use std::sync::Arc;

use async_trait::async_trait;

use crate::consumers::{ConsumerResult, MessageConsumer};
use crate::error::Error;
use crate::message::{MessageContext, MessageResponse};

/// What a scope decided about the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    /// Continue to the next scope, or to the terminal consumer.
    Proceed,
    /// End the chain: the message counts as successfully consumed and the
    /// terminal consumer is not invoked.
    Stop,
}

/// A pre-processor wrapped around a terminal consumer.
#[async_trait]
pub trait MessageScope<M>: Send + Sync
where
    M: Send + 'static,
{
    async fn wrap(&self, message: &M, context: &MessageContext) -> anyhow::Result<ScopeOutcome>;
}

/// Runs an ordered, non-empty list of scopes before the terminal consumer.
///
/// A scope returning [`ScopeOutcome::Stop`] short-circuits the chain and
/// the message is disposed as consumed. A scope error propagates out of
/// `consume` and becomes the subscription's consumer failure.
pub struct ScopedMessageConsumer<M> {
    consumer: Arc<dyn MessageConsumer<M>>,
    scopes: Vec<Arc<dyn MessageScope<M>>>,
}

impl<M> std::fmt::Debug for ScopedMessageConsumer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedMessageConsumer")
            .field("scopes", &self.scopes.len())
            .finish()
    }
}

impl<M> ScopedMessageConsumer<M>
where
    M: Send + 'static,
{
    pub fn new(
        consumer: impl MessageConsumer<M> + 'static,
        scopes: Vec<Arc<dyn MessageScope<M>>>,
    ) -> Result<Self, Error> {
        if scopes.is_empty() {
            return Err(Error::Configuration(
                "a scoped consumer requires at least one scope".to_string(),
            ));
        }
        Ok(Self {
            consumer: Arc::new(consumer),
            scopes,
        })
    }
}

#[async_trait]
impl<M> MessageConsumer<M> for ScopedMessageConsumer<M>
where
    M: Send + Sync + 'static,
{
    async fn consume(&self, message: M, context: &MessageContext) -> ConsumerResult {
        for scope in &self.scopes {
            match scope.wrap(&message, context).await? {
                ScopeOutcome::Proceed => {}
                ScopeOutcome::Stop => {
                    tracing::debug!(
                        message_id = %context.message_id(),
                        "scope ended the chain; message consumed"
                    );
                    return Ok(MessageResponse::Consume);
                }
            }
        }
        self.consumer.consume(message, context).await
    }
}
