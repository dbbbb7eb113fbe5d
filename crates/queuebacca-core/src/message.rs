// Value types shared between the publisher, the broker contract, and the
// subscription engine.
use std::time::SystemTime;

/// Identity of a logical queue.
///
/// A bin is purely a key: the broker implementation maps the name to its
/// native address and per-bin default visibility timeout.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MessageBin {
    name: String,
}

impl MessageBin {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for MessageBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Per-delivery metadata presented to consumers alongside the decoded
/// message.
#[derive(Debug, Clone)]
pub struct MessageContext {
    message_id: String,
    read_count: u32,
    first_received: SystemTime,
    raw_message: String,
}

impl MessageContext {
    pub fn new(
        message_id: impl Into<String>,
        read_count: u32,
        first_received: SystemTime,
        raw_message: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            read_count,
            first_received,
            raw_message: raw_message.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Number of times the broker has delivered this message, as reported
    /// by the broker. 1 on first delivery.
    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn first_received(&self) -> SystemTime {
        self.first_received
    }

    /// The serialized body as it arrived from the broker.
    pub fn raw_message(&self) -> &str {
        &self.raw_message
    }
}

/// A delivery pulled from the broker, prior to decoding.
///
/// Identity for engine bookkeeping is the receipt: two envelopes are
/// distinct deliveries whenever their receipts differ, even for the same
/// message id.
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    message_id: String,
    receipt: String,
    read_count: u32,
    first_received: SystemTime,
    raw_message: String,
}

impl IncomingEnvelope {
    pub fn new(
        message_id: impl Into<String>,
        receipt: impl Into<String>,
        read_count: u32,
        first_received: SystemTime,
        raw_message: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt: receipt.into(),
            read_count,
            first_received,
            raw_message: raw_message.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Opaque broker handle required to ack, extend, or return this
    /// specific delivery.
    pub fn receipt(&self) -> &str {
        &self.receipt
    }

    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn first_received(&self) -> SystemTime {
        self.first_received
    }

    pub fn raw_message(&self) -> &str {
        &self.raw_message
    }

    pub fn context(&self) -> MessageContext {
        MessageContext::new(
            self.message_id.clone(),
            self.read_count,
            self.first_received,
            self.raw_message.clone(),
        )
    }
}

impl PartialEq for IncomingEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.receipt == other.receipt
    }
}

impl Eq for IncomingEnvelope {}

impl std::hash::Hash for IncomingEnvelope {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.receipt.hash(state);
    }
}

/// Record of a message accepted by the broker.
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub message_id: String,
    pub raw_message: String,
}

/// The engine's decision after a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResponse {
    /// Delete the message from the broker.
    Consume,
    /// Return the message with a delay from the retry-delay generator.
    Retry,
    /// Drop without deleting; the broker's own dead-letter policy takes
    /// over once the visibility timeout expires.
    Terminate,
}
