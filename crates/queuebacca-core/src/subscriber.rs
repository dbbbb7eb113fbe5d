// Registry of running subscriptions for one broker client.
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::client::BrokerClient;
use crate::error::Error;
use crate::events::{SubscriptionEventListener, TracingEventListener};
use crate::message::MessageBin;
use crate::refresher::VisibilityRefresher;
use crate::serializer::{JsonMessageSerializer, MessageSerializer};
use crate::subscription::{SubscriptionConfiguration, SubscriptionState};
use crate::worker::{SubscriptionWorker, advance_state};

/// Starts and tracks subscription workers against one broker client.
///
/// All subscriptions share a single visibility refresher, amortizing the
/// lease-extension machinery across every bin the application consumes.
pub struct Subscriber<C, S = JsonMessageSerializer> {
    client: Arc<C>,
    serializer: Arc<S>,
    refresher: Arc<VisibilityRefresher<C>>,
    listener: Arc<dyn SubscriptionEventListener>,
    active: std::sync::Mutex<Vec<Subscription>>,
}

impl<C> Subscriber<C, JsonMessageSerializer>
where
    C: BrokerClient,
{
    pub fn builder(client: Arc<C>) -> SubscriberBuilder<C, JsonMessageSerializer> {
        SubscriberBuilder {
            client,
            serializer: JsonMessageSerializer,
            listener: None,
        }
    }
}

impl<C, S> Subscriber<C, S>
where
    C: BrokerClient,
    S: MessageSerializer,
{
    /// Start pulling `config.bin()` and dispatching to its consumer.
    ///
    /// Validates the bin against the broker's registry; an unknown bin is
    /// a configuration error. The returned handle cancels just this
    /// subscription.
    pub async fn subscribe<M>(
        &self,
        config: SubscriptionConfiguration<M>,
    ) -> Result<Subscription, Error>
    where
        M: DeserializeOwned + Send + 'static,
    {
        let bin = config.bin().clone();
        let visibility_timeout = self
            .client
            .visibility_timeout(&bin)
            .await
            .map_err(|err| Error::Configuration(format!("cannot subscribe to '{bin}': {err}")))?;

        let cancel = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(SubscriptionState::Built as u8));
        let worker = SubscriptionWorker::new(
            config,
            Arc::clone(&self.client),
            Arc::clone(&self.serializer),
            Arc::clone(&self.refresher),
            Arc::clone(&self.listener),
            visibility_timeout,
            cancel.clone(),
            Arc::clone(&state),
        );
        let join = tokio::spawn(worker.run());

        let subscription = Subscription {
            inner: Arc::new(SubscriptionInner {
                bin,
                cancel,
                state,
                worker: tokio::sync::Mutex::new(Some(join)),
            }),
        };
        self.active
            .lock()
            .expect("subscription registry lock")
            .push(subscription.clone());
        Ok(subscription)
    }

    /// Cancel every registered subscription and wait for each to drain.
    pub async fn cancel_all(&self) {
        let subscriptions = {
            let mut active = self.active.lock().expect("subscription registry lock");
            std::mem::take(&mut *active)
        };
        for subscription in subscriptions {
            subscription.cancel().await;
        }
    }

    /// The shared refresher, exposed for inspection.
    pub fn refresher(&self) -> &VisibilityRefresher<C> {
        &self.refresher
    }
}

pub struct SubscriberBuilder<C, S> {
    client: Arc<C>,
    serializer: S,
    listener: Option<Arc<dyn SubscriptionEventListener>>,
}

impl<C, S> SubscriberBuilder<C, S>
where
    C: BrokerClient,
    S: MessageSerializer,
{
    pub fn with_serializer<S2: MessageSerializer>(self, serializer: S2) -> SubscriberBuilder<C, S2> {
        SubscriberBuilder {
            client: self.client,
            serializer,
            listener: self.listener,
        }
    }

    pub fn with_event_listener(mut self, listener: impl SubscriptionEventListener) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> Subscriber<C, S> {
        Subscriber {
            refresher: Arc::new(VisibilityRefresher::new(Arc::clone(&self.client))),
            client: self.client,
            serializer: Arc::new(self.serializer),
            listener: self
                .listener
                .unwrap_or_else(|| Arc::new(TracingEventListener)),
            active: std::sync::Mutex::new(Vec::new()),
        }
    }
}

/// Handle to one running subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

#[derive(Debug)]
struct SubscriptionInner {
    bin: MessageBin,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Subscription {
    pub fn bin(&self) -> &MessageBin {
        &self.inner.bin
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Stop pulling and wait for in-flight consumer tasks to drain (bounded
    /// by the engine's drain grace). Safe to call more than once.
    pub async fn cancel(&self) {
        advance_state(&self.inner.state, SubscriptionState::Cancelling);
        self.inner.cancel.cancel();
        tracing::info!(bin = %self.inner.bin, "subscription cancelling");
        let join = self.inner.worker.lock().await.take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                tracing::error!(bin = %self.inner.bin, error = %err, "subscription worker panicked");
            }
        }
    }
}
