// The per-subscription pull/dispatch loop.
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::BrokerClient;
use crate::config::{DRAIN_GRACE, RECEIVE_FAILURE_BACKOFF};
use crate::consumers::MessageConsumer;
use crate::error::BrokerError;
use crate::events::{SubscriptionEventListener, TimingEvent};
use crate::message::{IncomingEnvelope, MessageBin, MessageResponse};
use crate::refresher::VisibilityRefresher;
use crate::resolver::ExceptionResolver;
use crate::retry::{RetryDelayGenerator, clamp_delay};
use crate::serializer::MessageSerializer;
use crate::subscription::{SubscriptionConfiguration, SubscriptionFinalizer, SubscriptionState};

pub(crate) fn advance_state(state: &AtomicU8, to: SubscriptionState) {
    state.fetch_max(to as u8, Ordering::SeqCst);
}

/// Everything a consumption task needs, shared once per subscription.
struct Pipeline<M, C, S> {
    bin: MessageBin,
    consumer: Arc<dyn MessageConsumer<M>>,
    resolver: Arc<ExceptionResolver>,
    retry_delay: Arc<dyn RetryDelayGenerator>,
    finalizer: Option<Arc<SubscriptionFinalizer>>,
    client: Arc<C>,
    serializer: Arc<S>,
    refresher: Arc<VisibilityRefresher<C>>,
    listener: Arc<dyn SubscriptionEventListener>,
}

/// Runs one subscription: pulls batches, admits under the capacity gate,
/// dispatches to consumer tasks, and drains them on cancellation.
///
/// Admission discipline: the puller holds no permits itself. It probes the
/// semaphore for current headroom before each pull, asks the broker for at
/// most that many messages, then takes one permit per returned envelope
/// before spawning its consumption task. The permit travels into the task
/// and is released when the task finishes, so in-flight work can never
/// exceed the configured capacity.
pub(crate) struct SubscriptionWorker<M, C, S> {
    pipeline: Arc<Pipeline<M, C, S>>,
    message_capacity: usize,
    visibility_timeout: Duration,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
}

impl<M, C, S> SubscriptionWorker<M, C, S>
where
    M: DeserializeOwned + Send + 'static,
    C: BrokerClient,
    S: MessageSerializer,
{
    pub(crate) fn new(
        config: SubscriptionConfiguration<M>,
        client: Arc<C>,
        serializer: Arc<S>,
        refresher: Arc<VisibilityRefresher<C>>,
        listener: Arc<dyn SubscriptionEventListener>,
        visibility_timeout: Duration,
        cancel: CancellationToken,
        state: Arc<AtomicU8>,
    ) -> Self {
        let message_capacity = config.message_capacity();
        let pipeline = Arc::new(Pipeline {
            bin: config.bin().clone(),
            consumer: config.consumer(),
            resolver: config.exception_resolver(),
            retry_delay: config.retry_delay(),
            finalizer: config.finalizer(),
            client,
            serializer,
            refresher,
            listener,
        });
        Self {
            pipeline,
            message_capacity,
            visibility_timeout,
            permits: Arc::new(Semaphore::new(message_capacity)),
            cancel,
            state,
        }
    }

    pub(crate) async fn run(self) {
        advance_state(&self.state, SubscriptionState::Running);
        let tracker = TaskTracker::new();
        tracing::info!(
            bin = %self.pipeline.bin,
            capacity = self.message_capacity,
            "subscription running"
        );

        while !self.cancel.is_cancelled() {
            // Admission before pulling: wait until at least one slot is
            // free, and only ask the broker for the headroom we have.
            let probe = tokio::select! {
                _ = self.cancel.cancelled() => break,
                acquired = Arc::clone(&self.permits).acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let available = self.permits.available_permits() + 1;
            drop(probe);

            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                retrieved = self.pipeline.client.retrieve_messages(&self.pipeline.bin, available) => {
                    match retrieved {
                        Ok(batch) => batch,
                        Err(BrokerError::Cancelled) => break,
                        Err(err) => {
                            tracing::warn!(
                                bin = %self.pipeline.bin,
                                error = %err,
                                "retrieve failed"
                            );
                            metrics::counter!("queuebacca_receive_failures_total").increment(1);
                            tokio::time::sleep(RECEIVE_FAILURE_BACKOFF).await;
                            continue;
                        }
                    }
                }
            };

            for envelope in &batch {
                tracing::debug!(
                    bin = %self.pipeline.bin,
                    message_id = %envelope.message_id(),
                    read_count = envelope.read_count(),
                    "received message"
                );
                self.pipeline
                    .refresher
                    .schedule_refresh(envelope, &self.pipeline.bin, self.visibility_timeout);
            }

            let mut envelopes = batch.into_iter();
            let mut abandoned: Option<IncomingEnvelope> = None;
            for envelope in &mut envelopes {
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        abandoned = Some(envelope);
                        break;
                    }
                    acquired = Arc::clone(&self.permits).acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => {
                            abandoned = Some(envelope);
                            break;
                        }
                    },
                };
                tracker.spawn(handle_envelope(
                    Arc::clone(&self.pipeline),
                    envelope,
                    permit,
                ));
            }
            if let Some(first) = abandoned {
                // Cancelled mid-batch: the rest are never admitted, so no
                // refresh may outlive them. The broker redelivers once the
                // original lease lapses.
                for envelope in std::iter::once(first).chain(envelopes) {
                    self.pipeline.refresher.cancel_refresh(&envelope);
                }
                break;
            }
        }

        advance_state(&self.state, SubscriptionState::Cancelling);
        tracker.close();
        if tokio::time::timeout(DRAIN_GRACE, tracker.wait()).await.is_err() {
            tracing::warn!(
                bin = %self.pipeline.bin,
                "consumer tasks still running after drain grace"
            );
        }
        advance_state(&self.state, SubscriptionState::Terminated);
        tracing::info!(bin = %self.pipeline.bin, "subscription terminated");
    }
}

/// Cancels the envelope's refresh exactly once, whatever path the
/// consumption task takes out of its scope.
struct RefreshGuard<'a, C: BrokerClient> {
    refresher: &'a VisibilityRefresher<C>,
    envelope: &'a IncomingEnvelope,
}

impl<C: BrokerClient> Drop for RefreshGuard<'_, C> {
    fn drop(&mut self) {
        self.refresher.cancel_refresh(self.envelope);
    }
}

async fn handle_envelope<M, C, S>(
    pipeline: Arc<Pipeline<M, C, S>>,
    envelope: IncomingEnvelope,
    permit: OwnedSemaphorePermit,
) where
    M: DeserializeOwned + Send + 'static,
    C: BrokerClient,
    S: MessageSerializer,
{
    let started = Instant::now();
    let context = envelope.context();
    metrics::gauge!("queuebacca_in_flight", "bin" => pipeline.bin.name().to_string())
        .increment(1.0);

    let guard = RefreshGuard {
        refresher: &*pipeline.refresher,
        envelope: &envelope,
    };
    let disposition = match pipeline.serializer.from_string::<M>(envelope.raw_message()) {
        Ok(message) => match pipeline.consumer.consume(message, &context).await {
            Ok(response) => response,
            Err(failure) => pipeline.resolver.resolve(&failure, &context),
        },
        Err(decode_failure) => pipeline
            .resolver
            .resolve(&anyhow::Error::new(decode_failure), &context),
    };
    // Refresh stops before the disposition reaches the broker.
    drop(guard);

    match disposition {
        MessageResponse::Consume => {
            if let Err(err) = pipeline
                .client
                .dispose_message(&pipeline.bin, &envelope)
                .await
            {
                // The lease lapses and the broker redelivers; at-least-once
                // semantics absorb the lost ack.
                tracing::warn!(
                    bin = %pipeline.bin,
                    message_id = %envelope.message_id(),
                    error = %err,
                    "dispose failed"
                );
            }
            metrics::counter!("queuebacca_messages_consumed_total").increment(1);
        }
        MessageResponse::Retry => {
            let delay = clamp_delay(pipeline.retry_delay.next_delay(envelope.read_count()));
            if let Err(err) = pipeline
                .client
                .return_message(&pipeline.bin, &envelope, delay)
                .await
            {
                tracing::warn!(
                    bin = %pipeline.bin,
                    message_id = %envelope.message_id(),
                    error = %err,
                    "return failed"
                );
            }
            metrics::counter!("queuebacca_messages_retried_total").increment(1);
        }
        MessageResponse::Terminate => {
            tracing::debug!(
                bin = %pipeline.bin,
                message_id = %envelope.message_id(),
                "terminated; left to the broker's dead-letter policy"
            );
            metrics::counter!("queuebacca_messages_terminated_total").increment(1);
        }
    }

    if let Some(finalizer) = &pipeline.finalizer {
        finalizer(&envelope, disposition);
    }
    pipeline.listener.on_timing(&TimingEvent {
        bin: pipeline.bin.clone(),
        message_type: std::any::type_name::<M>(),
        message_id: envelope.message_id().to_string(),
        timestamp: SystemTime::now(),
        duration: started.elapsed(),
        disposition,
    });
    metrics::gauge!("queuebacca_in_flight", "bin" => pipeline.bin.name().to_string())
        .decrement(1.0);
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::consumer_fn;
    use crate::error::SerializationError;
    use crate::events::TracingEventListener;
    use crate::message::OutgoingEnvelope;
    use crate::retry::ConstantRetryDelay;
    use crate::serializer::JsonMessageSerializer;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Hands out pre-scripted batches, then idles like a long poll.
    #[derive(Default)]
    struct ScriptedClient {
        batches: Mutex<VecDeque<Vec<IncomingEnvelope>>>,
        max_requested: AtomicUsize,
        disposed: Mutex<Vec<String>>,
        returned: Mutex<Vec<(String, Duration)>>,
    }

    impl ScriptedClient {
        fn with_batches(batches: Vec<Vec<IncomingEnvelope>>) -> Self {
            Self {
                batches: Mutex::new(batches.into_iter().collect()),
                ..Self::default()
            }
        }

        fn disposed(&self) -> Vec<String> {
            self.disposed.lock().expect("disposed lock").clone()
        }

        fn returned(&self) -> Vec<(String, Duration)> {
            self.returned.lock().expect("returned lock").clone()
        }
    }

    #[async_trait]
    impl BrokerClient for ScriptedClient {
        async fn send_message(
            &self,
            _bin: &MessageBin,
            _body: &str,
            _delay: Duration,
        ) -> Result<OutgoingEnvelope, BrokerError> {
            unimplemented!("not used by the worker")
        }

        async fn send_messages(
            &self,
            _bin: &MessageBin,
            _bodies: Vec<String>,
            _delay: Duration,
        ) -> Result<Vec<OutgoingEnvelope>, BrokerError> {
            unimplemented!("not used by the worker")
        }

        async fn retrieve_messages(
            &self,
            _bin: &MessageBin,
            max_messages: usize,
        ) -> Result<Vec<IncomingEnvelope>, BrokerError> {
            self.max_requested.fetch_max(max_messages, Ordering::SeqCst);
            let next = self.batches.lock().expect("batches lock").pop_front();
            match next {
                Some(batch) => Ok(batch),
                None => {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn return_message(
            &self,
            _bin: &MessageBin,
            envelope: &IncomingEnvelope,
            delay: Duration,
        ) -> Result<(), BrokerError> {
            self.returned
                .lock()
                .expect("returned lock")
                .push((envelope.receipt().to_string(), delay));
            Ok(())
        }

        async fn dispose_message(
            &self,
            _bin: &MessageBin,
            envelope: &IncomingEnvelope,
        ) -> Result<(), BrokerError> {
            self.disposed
                .lock()
                .expect("disposed lock")
                .push(envelope.receipt().to_string());
            Ok(())
        }

        async fn extend_visibility(
            &self,
            _bin: &MessageBin,
            _receipt: &str,
            _timeout: Duration,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn visibility_timeout(&self, _bin: &MessageBin) -> Result<Duration, BrokerError> {
            Ok(Duration::from_secs(30))
        }
    }

    fn envelope(receipt: &str, read_count: u32, body: &str) -> IncomingEnvelope {
        IncomingEnvelope::new(
            format!("m-{receipt}"),
            receipt,
            read_count,
            SystemTime::now(),
            body,
        )
    }

    struct Running {
        subscription_state: Arc<AtomicU8>,
        cancel: CancellationToken,
        permits: Arc<Semaphore>,
        refresher: Arc<VisibilityRefresher<ScriptedClient>>,
        join: tokio::task::JoinHandle<()>,
    }

    fn spawn_worker<M>(
        client: Arc<ScriptedClient>,
        config: SubscriptionConfiguration<M>,
    ) -> Running
    where
        M: DeserializeOwned + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(SubscriptionState::Built as u8));
        let refresher = Arc::new(VisibilityRefresher::new(Arc::clone(&client)));
        let worker = SubscriptionWorker::new(
            config,
            client,
            Arc::new(JsonMessageSerializer),
            Arc::clone(&refresher),
            Arc::new(TracingEventListener),
            Duration::from_secs(30),
            cancel.clone(),
            Arc::clone(&state),
        );
        let permits = Arc::clone(&worker.permits);
        let join = tokio::spawn(worker.run());
        Running {
            subscription_state: state,
            cancel,
            permits,
            refresher,
            join,
        }
    }

    async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
        let started = Instant::now();
        while !done() {
            assert!(started.elapsed() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn successful_consume_disposes_once() {
        let client = Arc::new(ScriptedClient::with_batches(vec![vec![envelope(
            "r-1", 1, "\"hello\"",
        )]]));
        let config = SubscriptionConfiguration::builder(
            MessageBin::new("orders"),
            consumer_fn(|_message: String, _context| Ok(MessageResponse::Consume)),
        )
        .build()
        .expect("config");
        let running = spawn_worker(Arc::clone(&client), config);

        wait_until(Duration::from_secs(2), || client.disposed().len() == 1).await;
        assert_eq!(client.disposed(), vec!["r-1".to_string()]);
        assert!(client.returned().is_empty());

        running.cancel.cancel();
        running.join.await.expect("worker join");
    }

    #[tokio::test]
    async fn failure_maps_to_retry_with_generated_delay() {
        let client = Arc::new(ScriptedClient::with_batches(vec![vec![envelope(
            "r-1", 3, "\"hello\"",
        )]]));
        let config = SubscriptionConfiguration::builder(
            MessageBin::new("orders"),
            consumer_fn(|_message: String, _context| Err(anyhow::anyhow!("boom"))),
        )
        .with_retry_delay_generator(ConstantRetryDelay::new(Duration::from_secs(7)))
        .build()
        .expect("config");
        let running = spawn_worker(Arc::clone(&client), config);

        wait_until(Duration::from_secs(2), || client.returned().len() == 1).await;
        assert_eq!(
            client.returned(),
            vec![("r-1".to_string(), Duration::from_secs(7))]
        );
        assert!(client.disposed().is_empty());

        running.cancel.cancel();
        running.join.await.expect("worker join");
    }

    #[tokio::test]
    async fn terminate_touches_no_broker_operation() {
        #[derive(thiserror::Error, Debug)]
        #[error("poison")]
        struct Poison;

        let client = Arc::new(ScriptedClient::with_batches(vec![vec![envelope(
            "r-1", 1, "\"hello\"",
        )]]));
        let resolver = ExceptionResolver::builder()
            .on::<Poison, _>(|_, _| MessageResponse::Terminate)
            .build();
        let finalized = Arc::new(AtomicUsize::new(0));
        let finalized_probe = Arc::clone(&finalized);
        let config = SubscriptionConfiguration::builder(
            MessageBin::new("orders"),
            consumer_fn(|_message: String, _context| Err(anyhow::Error::new(Poison))),
        )
        .with_exception_resolver(resolver)
        .with_finalizer(move |_envelope, disposition| {
            assert_eq!(disposition, MessageResponse::Terminate);
            finalized_probe.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("config");
        let running = spawn_worker(Arc::clone(&client), config);

        wait_until(Duration::from_secs(2), || {
            finalized.load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(client.disposed().is_empty());
        assert!(client.returned().is_empty());
        assert_eq!(running.refresher.active_refreshes(), 0);

        running.cancel.cancel();
        running.join.await.expect("worker join");
    }

    #[tokio::test]
    async fn decode_failure_routes_through_the_resolver() {
        let client = Arc::new(ScriptedClient::with_batches(vec![vec![envelope(
            "r-1", 1, "{not json",
        )]]));
        let resolver = ExceptionResolver::builder()
            .on::<SerializationError, _>(|_, _| MessageResponse::Terminate)
            .build();
        let consumed = Arc::new(AtomicUsize::new(0));
        let consumed_probe = Arc::clone(&consumed);
        let finalized = Arc::new(AtomicUsize::new(0));
        let finalized_probe = Arc::clone(&finalized);
        let config = SubscriptionConfiguration::builder(
            MessageBin::new("orders"),
            consumer_fn(move |_message: String, _context| {
                consumed_probe.fetch_add(1, Ordering::SeqCst);
                Ok(MessageResponse::Consume)
            }),
        )
        .with_exception_resolver(resolver)
        .with_finalizer(move |_envelope, disposition| {
            assert_eq!(disposition, MessageResponse::Terminate);
            finalized_probe.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("config");
        let running = spawn_worker(Arc::clone(&client), config);

        wait_until(Duration::from_secs(2), || {
            finalized.load(Ordering::SeqCst) == 1
        })
        .await;
        assert_eq!(consumed.load(Ordering::SeqCst), 0);

        running.cancel.cancel();
        running.join.await.expect("worker join");
    }

    #[tokio::test]
    async fn pull_requests_are_bounded_by_capacity() {
        let client = Arc::new(ScriptedClient::with_batches(vec![vec![
            envelope("r-1", 1, "\"a\""),
            envelope("r-2", 1, "\"b\""),
            envelope("r-3", 1, "\"c\""),
        ]]));
        let config = SubscriptionConfiguration::builder(
            MessageBin::new("orders"),
            consumer_fn(|_message: String, _context| Ok(MessageResponse::Consume)),
        )
        .with_message_capacity(3)
        .build()
        .expect("config");
        let running = spawn_worker(Arc::clone(&client), config);

        wait_until(Duration::from_secs(2), || client.disposed().len() == 3).await;
        assert!(running.permits.available_permits() <= 3);
        assert!(client.max_requested.load(Ordering::SeqCst) <= 3);

        running.cancel.cancel();
        running.join.await.expect("worker join");
    }

    #[tokio::test]
    async fn termination_restores_all_permits_and_refreshes() {
        let client = Arc::new(ScriptedClient::with_batches(vec![vec![
            envelope("r-1", 1, "\"a\""),
            envelope("r-2", 1, "\"b\""),
        ]]));
        let config = SubscriptionConfiguration::builder(
            MessageBin::new("orders"),
            consumer_fn(|_message: String, _context| Ok(MessageResponse::Consume)),
        )
        .with_message_capacity(2)
        .build()
        .expect("config");
        let running = spawn_worker(Arc::clone(&client), config);

        wait_until(Duration::from_secs(2), || client.disposed().len() == 2).await;
        running.cancel.cancel();
        running.join.await.expect("worker join");

        assert_eq!(running.permits.available_permits(), 2);
        assert_eq!(running.refresher.active_refreshes(), 0);
        assert_eq!(
            SubscriptionState::from_u8(running.subscription_state.load(Ordering::SeqCst)),
            SubscriptionState::Terminated
        );
    }
}
