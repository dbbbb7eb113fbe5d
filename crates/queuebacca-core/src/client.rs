// The broker contract the engine is written against.
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::message::{IncomingEnvelope, MessageBin, OutgoingEnvelope};

/// Per-call ceiling on retrieved messages, matching the reference broker's
/// batch limit. Implementations cap `max_messages` at this value.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Upper bound on how long a single `retrieve_messages` call may block.
/// Keeping the poll bounded guarantees the puller re-checks cancellation
/// periodically even without a wakeup signal.
pub const RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// The broker's accepted range for delay seconds (retry delays and send
/// delays alike).
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Largest serialized body the broker accepts. The reference broker caps
/// bodies at 256 KB; the comparison is in bytes.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 262_144;

/// Operations the subscription engine requires of a queue backend.
///
/// Implementations must be shareable: the puller, the consumer tasks (for
/// acks), and the visibility refresher all call into the same client
/// concurrently. `retrieve_messages` is a long poll bounded by
/// [`RECEIVE_WAIT`]; it is interrupted by dropping the future, and sync-SDK
/// adapters whose aborts surface as errors report
/// [`BrokerError::Cancelled`](crate::BrokerError::Cancelled) instead.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Send a single serialized body, visible after `delay`.
    async fn send_message(
        &self,
        bin: &MessageBin,
        body: &str,
        delay: Duration,
    ) -> Result<OutgoingEnvelope, BrokerError>;

    /// Send a batch of serialized bodies. Implementations may chunk (the
    /// reference broker takes 10 per request).
    async fn send_messages(
        &self,
        bin: &MessageBin,
        bodies: Vec<String>,
        delay: Duration,
    ) -> Result<Vec<OutgoingEnvelope>, BrokerError>;

    /// Long-poll for up to `max_messages` deliveries, capped at
    /// [`MAX_RECEIVE_BATCH`]. Blocks up to [`RECEIVE_WAIT`]; an empty
    /// result is a normal poll timeout.
    async fn retrieve_messages(
        &self,
        bin: &MessageBin,
        max_messages: usize,
    ) -> Result<Vec<IncomingEnvelope>, BrokerError>;

    /// Make the delivery re-deliverable after `delay` (change visibility).
    async fn return_message(
        &self,
        bin: &MessageBin,
        envelope: &IncomingEnvelope,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Delete the delivery (ack).
    async fn dispose_message(
        &self,
        bin: &MessageBin,
        envelope: &IncomingEnvelope,
    ) -> Result<(), BrokerError>;

    /// Push the delivery's visibility deadline out to now + `timeout`.
    async fn extend_visibility(
        &self,
        bin: &MessageBin,
        receipt: &str,
        timeout: Duration,
    ) -> Result<(), BrokerError>;

    /// The bin's default visibility timeout from the broker's bin registry.
    /// Drives the refresher's extend cadence.
    async fn visibility_timeout(&self, bin: &MessageBin) -> Result<Duration, BrokerError>;
}
