// Immutable per-subscription configuration and lifecycle states.
use std::sync::Arc;

use crate::config::{DEFAULT_MESSAGE_CAPACITY, DEFAULT_RETRY_DELAY};
use crate::consumers::MessageConsumer;
use crate::error::Error;
use crate::message::{IncomingEnvelope, MessageBin, MessageResponse};
use crate::resolver::ExceptionResolver;
use crate::retry::{ConstantRetryDelay, RetryDelayGenerator};

/// Hook invoked after a disposition has been applied to an envelope.
pub type SubscriptionFinalizer = dyn Fn(&IncomingEnvelope, MessageResponse) + Send + Sync;

/// Lifecycle of a subscription. Transitions only move forward:
/// `Built → Running → Cancelling → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Built = 0,
    Running = 1,
    Cancelling = 2,
    Terminated = 3,
}

impl SubscriptionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Built,
            1 => Self::Running,
            2 => Self::Cancelling,
            _ => Self::Terminated,
        }
    }
}

/// Everything a subscription needs: the bin to pull from, the typed
/// consumer, and the policies around it. Created through
/// [`SubscriptionConfiguration::builder`].
pub struct SubscriptionConfiguration<M> {
    bin: MessageBin,
    consumer: Arc<dyn MessageConsumer<M>>,
    message_capacity: usize,
    exception_resolver: Arc<ExceptionResolver>,
    retry_delay: Arc<dyn RetryDelayGenerator>,
    finalizer: Option<Arc<SubscriptionFinalizer>>,
}

impl<M> std::fmt::Debug for SubscriptionConfiguration<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfiguration")
            .field("bin", &self.bin)
            .field("message_capacity", &self.message_capacity)
            .finish()
    }
}

impl<M> SubscriptionConfiguration<M>
where
    M: Send + 'static,
{
    pub fn builder(
        bin: MessageBin,
        consumer: impl MessageConsumer<M> + 'static,
    ) -> SubscriptionConfigurationBuilder<M> {
        SubscriptionConfigurationBuilder {
            bin,
            consumer: Arc::new(consumer),
            message_capacity: DEFAULT_MESSAGE_CAPACITY,
            exception_resolver: None,
            retry_delay: None,
            finalizer: None,
        }
    }

    pub fn bin(&self) -> &MessageBin {
        &self.bin
    }

    /// Maximum number of in-flight messages for this subscription.
    pub fn message_capacity(&self) -> usize {
        self.message_capacity
    }

    pub(crate) fn consumer(&self) -> Arc<dyn MessageConsumer<M>> {
        Arc::clone(&self.consumer)
    }

    pub(crate) fn exception_resolver(&self) -> Arc<ExceptionResolver> {
        Arc::clone(&self.exception_resolver)
    }

    pub(crate) fn retry_delay(&self) -> Arc<dyn RetryDelayGenerator> {
        Arc::clone(&self.retry_delay)
    }

    pub(crate) fn finalizer(&self) -> Option<Arc<SubscriptionFinalizer>> {
        self.finalizer.as_ref().map(Arc::clone)
    }
}

pub struct SubscriptionConfigurationBuilder<M> {
    bin: MessageBin,
    consumer: Arc<dyn MessageConsumer<M>>,
    message_capacity: usize,
    exception_resolver: Option<ExceptionResolver>,
    retry_delay: Option<Arc<dyn RetryDelayGenerator>>,
    finalizer: Option<Arc<SubscriptionFinalizer>>,
}

impl<M> SubscriptionConfigurationBuilder<M>
where
    M: Send + 'static,
{
    /// Max in-flight messages. Defaults to 1; zero is refused at build.
    pub fn with_message_capacity(mut self, capacity: usize) -> Self {
        self.message_capacity = capacity;
        self
    }

    /// Resolver for consumer failures. Defaults to retrying everything.
    pub fn with_exception_resolver(mut self, resolver: ExceptionResolver) -> Self {
        self.exception_resolver = Some(resolver);
        self
    }

    /// Delay strategy for retried messages. Defaults to a constant
    /// [`DEFAULT_RETRY_DELAY`].
    pub fn with_retry_delay_generator(
        mut self,
        generator: impl RetryDelayGenerator,
    ) -> Self {
        self.retry_delay = Some(Arc::new(generator));
        self
    }

    /// Hook invoked with each envelope and its disposition.
    pub fn with_finalizer(
        mut self,
        finalizer: impl Fn(&IncomingEnvelope, MessageResponse) + Send + Sync + 'static,
    ) -> Self {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn build(self) -> Result<SubscriptionConfiguration<M>, Error> {
        if self.bin.name().is_empty() {
            return Err(Error::Configuration(
                "message bin name must not be empty".to_string(),
            ));
        }
        if self.message_capacity == 0 {
            return Err(Error::Configuration(
                "message capacity must be positive".to_string(),
            ));
        }
        Ok(SubscriptionConfiguration {
            bin: self.bin,
            consumer: self.consumer,
            message_capacity: self.message_capacity,
            exception_resolver: Arc::new(self.exception_resolver.unwrap_or_default()),
            retry_delay: self
                .retry_delay
                .unwrap_or_else(|| Arc::new(ConstantRetryDelay::new(DEFAULT_RETRY_DELAY))),
            finalizer: self.finalizer,
        })
    }
}
