// Error taxonomy for the engine and the broker contract.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid wiring detected at build or subscribe time: missing consumer
    /// for a routed type, duplicate registration, non-positive capacity.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The serialized body exceeds the broker's accepted size.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

/// Failure surfaced by a broker client operation. The engine never retries
/// these internally; the broker's visibility timeout is the safety net for
/// lost acks and extends.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("message bin not found: {0}")]
    BinNotFound(String),

    /// The receipt does not name an in-flight delivery, either because it
    /// was already disposed or because its visibility lease lapsed.
    #[error("unknown receipt: {0}")]
    UnknownReceipt(String),

    /// A blocked retrieve was interrupted by subscription shutdown.
    ///
    /// Async adapters are normally interrupted by future cancellation and
    /// never construct this; it exists for adapters wrapping synchronous
    /// SDKs whose aborted receives surface as errors.
    #[error("message retrieval cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Raised when a message body cannot be encoded or decoded. The
/// subscription worker treats decode failures as consumer failures and
/// routes them through the exception resolver.
#[derive(thiserror::Error, Debug)]
#[error("serialization failed: {reason}")]
pub struct SerializationError {
    reason: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SerializationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}
