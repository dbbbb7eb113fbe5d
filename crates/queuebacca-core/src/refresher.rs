// Keeps broker visibility leases alive while messages are in flight.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::BrokerClient;
use crate::message::{IncomingEnvelope, MessageBin};

/// Extends the visibility lease of each in-flight envelope until its
/// disposition is applied.
///
/// One instance is shared by every subscription of a subscriber; each
/// scheduled envelope gets a lightweight timer task registered in an
/// owning map keyed by receipt. Cancelling an entry whose task is mid-fire
/// is benign: a redundant extend is harmless.
pub struct VisibilityRefresher<C> {
    client: Arc<C>,
    tasks: Mutex<HashMap<String, tokio::task::AbortHandle>>,
}

impl<C> VisibilityRefresher<C>
where
    C: BrokerClient,
{
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Begin refreshing `envelope`'s lease. The first extend fires after
    /// half the visibility timeout (for short timeouts) or one minute
    /// before expiry, and repeats on the same cadence until cancelled.
    pub fn schedule_refresh(
        &self,
        envelope: &IncomingEnvelope,
        bin: &MessageBin,
        visibility_timeout: Duration,
    ) {
        let delay = refresh_delay(visibility_timeout);
        let client = Arc::clone(&self.client);
        let bin = bin.clone();
        let receipt = envelope.receipt().to_string();
        let message_id = envelope.message_id().to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                tracing::debug!(
                    message_id = %message_id,
                    bin = %bin,
                    timeout_secs = visibility_timeout.as_secs(),
                    "extending visibility lease"
                );
                if let Err(err) = client
                    .extend_visibility(&bin, &receipt, visibility_timeout)
                    .await
                {
                    // The lease will lapse and the broker's at-least-once
                    // semantics take over; the subscription keeps running.
                    tracing::warn!(
                        message_id = %message_id,
                        bin = %bin,
                        error = %err,
                        "visibility extend failed"
                    );
                    metrics::counter!("queuebacca_refresh_failures_total").increment(1);
                    break;
                }
                metrics::counter!("queuebacca_refreshes_total").increment(1);
            }
        })
        .abort_handle();

        let previous = self
            .tasks
            .lock()
            .expect("refresher map lock")
            .insert(envelope.receipt().to_string(), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop refreshing `envelope`. Idempotent; must be called before a
    /// disposition is applied.
    pub fn cancel_refresh(&self, envelope: &IncomingEnvelope) {
        let handle = self
            .tasks
            .lock()
            .expect("refresher map lock")
            .remove(envelope.receipt());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Number of envelopes currently under refresh.
    pub fn active_refreshes(&self) -> usize {
        self.tasks.lock().expect("refresher map lock").len()
    }
}

fn refresh_delay(visibility_timeout: Duration) -> Duration {
    if visibility_timeout < Duration::from_secs(120) {
        visibility_timeout / 2
    } else {
        visibility_timeout - Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::message::OutgoingEnvelope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    #[derive(Default)]
    struct ExtendCountingClient {
        extends: AtomicUsize,
        fail_extends: bool,
    }

    #[async_trait]
    impl BrokerClient for ExtendCountingClient {
        async fn send_message(
            &self,
            _bin: &MessageBin,
            _body: &str,
            _delay: Duration,
        ) -> Result<OutgoingEnvelope, BrokerError> {
            unimplemented!("not used by the refresher")
        }

        async fn send_messages(
            &self,
            _bin: &MessageBin,
            _bodies: Vec<String>,
            _delay: Duration,
        ) -> Result<Vec<OutgoingEnvelope>, BrokerError> {
            unimplemented!("not used by the refresher")
        }

        async fn retrieve_messages(
            &self,
            _bin: &MessageBin,
            _max_messages: usize,
        ) -> Result<Vec<IncomingEnvelope>, BrokerError> {
            unimplemented!("not used by the refresher")
        }

        async fn return_message(
            &self,
            _bin: &MessageBin,
            _envelope: &IncomingEnvelope,
            _delay: Duration,
        ) -> Result<(), BrokerError> {
            unimplemented!("not used by the refresher")
        }

        async fn dispose_message(
            &self,
            _bin: &MessageBin,
            _envelope: &IncomingEnvelope,
        ) -> Result<(), BrokerError> {
            unimplemented!("not used by the refresher")
        }

        async fn extend_visibility(
            &self,
            _bin: &MessageBin,
            _receipt: &str,
            _timeout: Duration,
        ) -> Result<(), BrokerError> {
            self.extends.fetch_add(1, Ordering::SeqCst);
            if self.fail_extends {
                return Err(BrokerError::UnknownReceipt("gone".to_string()));
            }
            Ok(())
        }

        async fn visibility_timeout(&self, _bin: &MessageBin) -> Result<Duration, BrokerError> {
            Ok(Duration::from_secs(30))
        }
    }

    fn envelope(receipt: &str) -> IncomingEnvelope {
        IncomingEnvelope::new("m-1", receipt, 1, SystemTime::now(), "{}")
    }

    #[test]
    fn short_timeouts_refresh_at_half_life() {
        assert_eq!(refresh_delay(Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(refresh_delay(Duration::from_secs(119)), Duration::from_millis(59_500));
    }

    #[test]
    fn long_timeouts_refresh_a_minute_before_expiry() {
        assert_eq!(refresh_delay(Duration::from_secs(120)), Duration::from_secs(60));
        assert_eq!(refresh_delay(Duration::from_secs(300)), Duration::from_secs(240));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_extended_until_cancelled() {
        let client = Arc::new(ExtendCountingClient::default());
        let refresher = VisibilityRefresher::new(Arc::clone(&client));
        let bin = MessageBin::new("orders");
        let env = envelope("r-1");

        // 200 ms timeout refreshes every 100 ms.
        refresher.schedule_refresh(&env, &bin, Duration::from_millis(200));
        assert_eq!(refresher.active_refreshes(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let before_cancel = client.extends.load(Ordering::SeqCst);
        assert!(before_cancel >= 2, "expected repeated extends, got {before_cancel}");

        refresher.cancel_refresh(&env);
        assert_eq!(refresher.active_refreshes(), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.extends.load(Ordering::SeqCst), before_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_failure_stops_the_chain_quietly() {
        let client = Arc::new(ExtendCountingClient {
            extends: AtomicUsize::new(0),
            fail_extends: true,
        });
        let refresher = VisibilityRefresher::new(Arc::clone(&client));
        let bin = MessageBin::new("orders");
        let env = envelope("r-2");

        refresher.schedule_refresh(&env, &bin, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(client.extends.load(Ordering::SeqCst), 1);

        // Cancelling after the chain already stopped stays a no-op.
        refresher.cancel_refresh(&env);
        assert_eq!(refresher.active_refreshes(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let client = Arc::new(ExtendCountingClient::default());
        let refresher = VisibilityRefresher::new(client);
        let bin = MessageBin::new("orders");
        let env = envelope("r-3");
        refresher.schedule_refresh(&env, &bin, Duration::from_secs(30));
        refresher.cancel_refresh(&env);
        refresher.cancel_refresh(&env);
        assert_eq!(refresher.active_refreshes(), 0);
    }
}
