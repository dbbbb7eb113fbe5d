// Typed publishing into message bins.
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::client::{BrokerClient, MAX_DELAY, MAX_MESSAGE_SIZE_BYTES};
use crate::error::{Error, Result};
use crate::message::{MessageBin, OutgoingEnvelope};
use crate::serializer::{JsonMessageSerializer, MessageSerializer};

/// Publishes typed messages: serializes, guards the broker's size cap, and
/// forwards to the broker client. Batches are chunked by the client.
pub struct Publisher<C, S = JsonMessageSerializer> {
    client: Arc<C>,
    serializer: Arc<S>,
}

impl<C> Publisher<C, JsonMessageSerializer>
where
    C: BrokerClient,
{
    pub fn builder(client: Arc<C>) -> PublisherBuilder<C, JsonMessageSerializer> {
        PublisherBuilder {
            client,
            serializer: JsonMessageSerializer,
        }
    }
}

impl<C, S> Publisher<C, S>
where
    C: BrokerClient,
    S: MessageSerializer,
{
    /// Send one message, visible immediately.
    pub async fn publish<M: Serialize>(
        &self,
        bin: &MessageBin,
        message: &M,
    ) -> Result<OutgoingEnvelope> {
        self.publish_delayed(bin, message, Duration::ZERO).await
    }

    /// Send one message that stays invisible for `delay`.
    pub async fn publish_delayed<M: Serialize>(
        &self,
        bin: &MessageBin,
        message: &M,
        delay: Duration,
    ) -> Result<OutgoingEnvelope> {
        let body = self.shape(message)?;
        let envelope = self
            .client
            .send_message(bin, &body, delay.min(MAX_DELAY))
            .await?;
        tracing::info!(bin = %bin, message_id = %envelope.message_id, "sent message");
        metrics::counter!("queuebacca_messages_sent_total", "bin" => bin.name().to_string())
            .increment(1);
        Ok(envelope)
    }

    /// Send a batch, visible immediately. The whole batch is serialized
    /// and size-checked before anything is handed to the broker.
    pub async fn publish_all<M: Serialize>(
        &self,
        bin: &MessageBin,
        messages: &[M],
    ) -> Result<Vec<OutgoingEnvelope>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let bodies = messages
            .iter()
            .map(|message| self.shape(message))
            .collect::<Result<Vec<_>>>()?;
        let envelopes = self
            .client
            .send_messages(bin, bodies, Duration::ZERO)
            .await?;
        tracing::info!(bin = %bin, count = envelopes.len(), "sent message batch");
        metrics::counter!("queuebacca_messages_sent_total", "bin" => bin.name().to_string())
            .increment(envelopes.len() as u64);
        Ok(envelopes)
    }

    fn shape<M: Serialize>(&self, message: &M) -> Result<String> {
        let body = self.serializer.to_string(message)?;
        if body.len() > MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::MessageTooLarge {
                size: body.len(),
                limit: MAX_MESSAGE_SIZE_BYTES,
            });
        }
        Ok(body)
    }
}

pub struct PublisherBuilder<C, S> {
    client: Arc<C>,
    serializer: S,
}

impl<C, S> PublisherBuilder<C, S>
where
    C: BrokerClient,
    S: MessageSerializer,
{
    pub fn with_serializer<S2: MessageSerializer>(self, serializer: S2) -> PublisherBuilder<C, S2> {
        PublisherBuilder {
            client: self.client,
            serializer,
        }
    }

    pub fn build(self) -> Publisher<C, S> {
        Publisher {
            client: self.client,
            serializer: Arc::new(self.serializer),
        }
    }
}
