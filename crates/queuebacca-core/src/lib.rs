//! Publish/subscribe engine for visibility-timeout message queues.
//!
//! Applications publish typed messages into named bins and subscribe
//! long-running consumers that pull, dispatch, retry, and acknowledge
//! messages with bounded concurrency. The broker behind a bin is abstract:
//! anything with visibility-timeout semantics that implements
//! [`BrokerClient`] works, and the engine keeps its at-least-once delivery
//! contract intact. No ordering guarantees, no durable engine-side state.
//!
//! The heart of the crate is the subscription worker: per subscription it
//! long-polls the bin, admits messages under the configured in-flight cap,
//! runs the typed consumer on the runtime, keeps the broker-side visibility
//! lease fresh while work is in progress, and applies exactly one
//! disposition per delivery: delete, return-with-delay, or terminate.

pub mod client;
pub mod config;
pub mod consumers;
pub mod error;
pub mod events;
pub mod message;
pub mod publisher;
pub mod refresher;
pub mod resolver;
pub mod retry;
pub mod serializer;
pub mod subscriber;
pub mod subscription;

mod worker;

pub use client::BrokerClient;
pub use consumers::{ConsumerResult, MessageConsumer};
pub use error::{BrokerError, Error, Result, SerializationError};
pub use events::{SubscriptionEventListener, TimingEvent};
pub use message::{
    IncomingEnvelope, MessageBin, MessageContext, MessageResponse, OutgoingEnvelope,
};
pub use publisher::Publisher;
pub use refresher::VisibilityRefresher;
pub use resolver::ExceptionResolver;
pub use retry::{ConstantRetryDelay, ExponentialRetryDelay, RetryDelayGenerator};
pub use serializer::{JsonMessageSerializer, MessageSerializer};
pub use subscriber::{Subscriber, Subscription};
pub use subscription::{SubscriptionConfiguration, SubscriptionState};
