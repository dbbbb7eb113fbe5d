// Consumer trait plus the routing and scoping combinators.
use async_trait::async_trait;

use crate::message::{MessageContext, MessageResponse};

pub mod routing;
pub mod scoped;

pub use routing::{RoutedMessage, RoutingMessageConsumer};
pub use scoped::{MessageScope, ScopeOutcome, ScopedMessageConsumer};

/// What a consume attempt produced: a disposition, or a failure for the
/// exception resolver.
pub type ConsumerResult = anyhow::Result<MessageResponse>;

/// Application-side handler for messages of type `M`.
#[async_trait]
pub trait MessageConsumer<M>: Send + Sync
where
    M: Send + 'static,
{
    async fn consume(&self, message: M, context: &MessageContext) -> ConsumerResult;
}

/// Wrap a synchronous closure as a consumer.
///
/// ```
/// use queuebacca_core::consumers::consumer_fn;
/// use queuebacca_core::MessageResponse;
///
/// let consumer = consumer_fn(|count: u64, _context| {
///     tracing::info!(count, "received");
///     Ok(MessageResponse::Consume)
/// });
/// # let _ = consumer;
/// ```
pub fn consumer_fn<M, F>(handler: F) -> FnMessageConsumer<F>
where
    M: Send + 'static,
    F: Fn(M, &MessageContext) -> ConsumerResult + Send + Sync,
{
    FnMessageConsumer { handler }
}

pub struct FnMessageConsumer<F> {
    handler: F,
}

#[async_trait]
impl<M, F> MessageConsumer<M> for FnMessageConsumer<F>
where
    M: Send + 'static,
    F: Fn(M, &MessageContext) -> ConsumerResult + Send + Sync,
{
    async fn consume(&self, message: M, context: &MessageContext) -> ConsumerResult {
        (self.handler)(message, context)
    }
}

// Shared consumers can be handed to a subscription while the caller keeps
// its own handle (a routing table it still wants to inspect, say).
#[async_trait]
impl<M, T> MessageConsumer<M> for std::sync::Arc<T>
where
    M: Send + 'static,
    T: MessageConsumer<M> + ?Sized,
{
    async fn consume(&self, message: M, context: &MessageContext) -> ConsumerResult {
        (**self).consume(message, context).await
    }
}
