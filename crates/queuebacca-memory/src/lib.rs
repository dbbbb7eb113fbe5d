//! In-memory broker with visibility-timeout semantics.
//!
//! Behaves like the reference queue service in miniature: registered bins,
//! delayed delivery, per-delivery receipts and read counts, leases that
//! lapse back into the queue, lease extension, and an optional
//! dead-letter cap. Suited to tests and local development; all state lives
//! in this process.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use queuebacca_core::client::{MAX_RECEIVE_BATCH, RECEIVE_WAIT};
use queuebacca_core::{
    BrokerClient, BrokerError, IncomingEnvelope, MessageBin, OutgoingEnvelope,
};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// In-process queue backend implementing the broker contract.
///
/// ```
/// use queuebacca_core::{BrokerClient, MessageBin};
/// use queuebacca_memory::MemoryBroker;
/// use std::time::Duration;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = MemoryBroker::new();
///     broker.register_bin("orders").await;
///     let bin = MessageBin::new("orders");
///     broker
///         .send_message(&bin, "{\"id\":1}", Duration::ZERO)
///         .await
///         .expect("send");
///     let batch = broker.retrieve_messages(&bin, 10).await.expect("retrieve");
///     assert_eq!(batch.len(), 1);
///     broker.dispose_message(&bin, &batch[0]).await.expect("dispose");
/// });
/// ```
#[derive(Default)]
pub struct MemoryBroker {
    bins: RwLock<HashMap<String, Arc<BinState>>>,
    counters: BrokerCounters,
    return_delays: std::sync::Mutex<Vec<Duration>>,
}

/// Running totals of broker operations, for assertions and smoke checks.
#[derive(Default)]
struct BrokerCounters {
    sends: AtomicU64,
    deliveries: AtomicU64,
    disposals: AtomicU64,
    returns: AtomicU64,
    extensions: AtomicU64,
}

/// Point-in-time snapshot of the operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub sends: u64,
    pub deliveries: u64,
    pub disposals: u64,
    pub returns: u64,
    pub extensions: u64,
}

struct BinState {
    visibility_timeout: Duration,
    max_receive_count: Option<u32>,
    queue: Mutex<BinQueue>,
    arrivals: Notify,
}

#[derive(Default)]
struct BinQueue {
    ready: VecDeque<StoredMessage>,
    delayed: Vec<(Instant, StoredMessage)>,
    in_flight: HashMap<String, LeasedMessage>,
    dead: Vec<StoredMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    read_count: u32,
    first_received: Option<SystemTime>,
}

struct LeasedMessage {
    message: StoredMessage,
    expires_at: Instant,
}

impl BinQueue {
    /// Move due delayed messages and lapsed leases back into the ready
    /// queue; leases past the receive cap go to the dead-letter store.
    fn promote(&mut self, max_receive_count: Option<u32>) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, message) = self.delayed.swap_remove(index);
                self.ready.push_back(message);
            } else {
                index += 1;
            }
        }
        let lapsed: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in lapsed {
            let Some(lease) = self.in_flight.remove(&receipt) else {
                continue;
            };
            match max_receive_count {
                Some(cap) if lease.message.read_count >= cap => {
                    tracing::debug!(
                        message_id = %lease.message.message_id,
                        read_count = lease.message.read_count,
                        "message moved to the dead-letter store"
                    );
                    self.dead.push(lease.message);
                }
                _ => self.ready.push_back(lease.message),
            }
        }
    }

    /// Earliest instant at which promotion could make progress.
    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(due, _)| *due).min();
        let leases = self.in_flight.values().map(|lease| lease.expires_at).min();
        match (delayed, leases) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bin with the default visibility timeout and no
    /// dead-letter cap.
    pub async fn register_bin(&self, name: impl Into<String>) {
        self.register_bin_with(name, DEFAULT_VISIBILITY_TIMEOUT, None)
            .await;
    }

    /// Register a bin with an explicit visibility timeout and an optional
    /// cap on deliveries before a message is dead-lettered.
    pub async fn register_bin_with(
        &self,
        name: impl Into<String>,
        visibility_timeout: Duration,
        max_receive_count: Option<u32>,
    ) {
        self.bins.write().await.insert(
            name.into(),
            Arc::new(BinState {
                visibility_timeout,
                max_receive_count,
                queue: Mutex::new(BinQueue::default()),
                arrivals: Notify::new(),
            }),
        );
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sends: self.counters.sends.load(Ordering::SeqCst),
            deliveries: self.counters.deliveries.load(Ordering::SeqCst),
            disposals: self.counters.disposals.load(Ordering::SeqCst),
            returns: self.counters.returns.load(Ordering::SeqCst),
            extensions: self.counters.extensions.load(Ordering::SeqCst),
        }
    }

    /// Delays passed to `return_message`, in call order.
    pub fn return_delays(&self) -> Vec<Duration> {
        self.return_delays.lock().expect("return delays lock").clone()
    }

    /// Messages currently waiting for delivery (ready or delayed).
    pub async fn queued_len(&self, bin: &MessageBin) -> usize {
        match self.bin(bin).await {
            Ok(state) => {
                let queue = state.queue.lock().await;
                queue.ready.len() + queue.delayed.len()
            }
            Err(_) => 0,
        }
    }

    /// Messages currently leased out to consumers.
    pub async fn in_flight_len(&self, bin: &MessageBin) -> usize {
        match self.bin(bin).await {
            Ok(state) => state.queue.lock().await.in_flight.len(),
            Err(_) => 0,
        }
    }

    /// Messages dead-lettered by the receive cap.
    pub async fn dead_len(&self, bin: &MessageBin) -> usize {
        match self.bin(bin).await {
            Ok(state) => state.queue.lock().await.dead.len(),
            Err(_) => 0,
        }
    }

    async fn bin(&self, bin: &MessageBin) -> Result<Arc<BinState>, BrokerError> {
        self.bins
            .read()
            .await
            .get(bin.name())
            .cloned()
            .ok_or_else(|| BrokerError::BinNotFound(bin.name().to_string()))
    }

    async fn enqueue(&self, state: &BinState, body: &str, delay: Duration) -> OutgoingEnvelope {
        let message = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            read_count: 0,
            first_received: None,
        };
        let envelope = OutgoingEnvelope {
            message_id: message.message_id.clone(),
            raw_message: message.body.clone(),
        };
        {
            let mut queue = state.queue.lock().await;
            if delay.is_zero() {
                queue.ready.push_back(message);
            } else {
                queue.delayed.push((Instant::now() + delay, message));
            }
        }
        state.arrivals.notify_one();
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        envelope
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn send_message(
        &self,
        bin: &MessageBin,
        body: &str,
        delay: Duration,
    ) -> Result<OutgoingEnvelope, BrokerError> {
        let state = self.bin(bin).await?;
        let envelope = self.enqueue(&state, body, delay).await;
        tracing::debug!(bin = %bin, message_id = %envelope.message_id, "accepted message");
        Ok(envelope)
    }

    async fn send_messages(
        &self,
        bin: &MessageBin,
        bodies: Vec<String>,
        delay: Duration,
    ) -> Result<Vec<OutgoingEnvelope>, BrokerError> {
        let state = self.bin(bin).await?;
        let mut envelopes = Vec::with_capacity(bodies.len());
        for body in &bodies {
            envelopes.push(self.enqueue(&state, body, delay).await);
        }
        tracing::debug!(bin = %bin, count = envelopes.len(), "accepted message batch");
        Ok(envelopes)
    }

    async fn retrieve_messages(
        &self,
        bin: &MessageBin,
        max_messages: usize,
    ) -> Result<Vec<IncomingEnvelope>, BrokerError> {
        let state = self.bin(bin).await?;
        let limit = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let poll_deadline = Instant::now() + RECEIVE_WAIT;
        loop {
            let (envelopes, next_wake) = {
                let mut queue = state.queue.lock().await;
                queue.promote(state.max_receive_count);
                let mut envelopes = Vec::new();
                while envelopes.len() < limit {
                    let Some(mut message) = queue.ready.pop_front() else {
                        break;
                    };
                    message.read_count += 1;
                    let first_received =
                        *message.first_received.get_or_insert_with(SystemTime::now);
                    let receipt = Uuid::new_v4().to_string();
                    envelopes.push(IncomingEnvelope::new(
                        message.message_id.clone(),
                        receipt.clone(),
                        message.read_count,
                        first_received,
                        message.body.clone(),
                    ));
                    queue.in_flight.insert(
                        receipt,
                        LeasedMessage {
                            message,
                            expires_at: Instant::now() + state.visibility_timeout,
                        },
                    );
                }
                (envelopes, queue.next_wake())
            };
            if !envelopes.is_empty() {
                self.counters
                    .deliveries
                    .fetch_add(envelopes.len() as u64, Ordering::SeqCst);
                return Ok(envelopes);
            }
            let now = Instant::now();
            if now >= poll_deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_wake.map_or(poll_deadline, |wake| wake.min(poll_deadline));
            tokio::select! {
                _ = state.arrivals.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn return_message(
        &self,
        bin: &MessageBin,
        envelope: &IncomingEnvelope,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let state = self.bin(bin).await?;
        {
            let mut queue = state.queue.lock().await;
            let lease = queue
                .in_flight
                .remove(envelope.receipt())
                .ok_or_else(|| BrokerError::UnknownReceipt(envelope.receipt().to_string()))?;
            queue.delayed.push((Instant::now() + delay, lease.message));
        }
        state.arrivals.notify_one();
        self.counters.returns.fetch_add(1, Ordering::SeqCst);
        self.return_delays
            .lock()
            .expect("return delays lock")
            .push(delay);
        Ok(())
    }

    async fn dispose_message(
        &self,
        bin: &MessageBin,
        envelope: &IncomingEnvelope,
    ) -> Result<(), BrokerError> {
        let state = self.bin(bin).await?;
        let mut queue = state.queue.lock().await;
        queue
            .in_flight
            .remove(envelope.receipt())
            .ok_or_else(|| BrokerError::UnknownReceipt(envelope.receipt().to_string()))?;
        self.counters.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        bin: &MessageBin,
        receipt: &str,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let state = self.bin(bin).await?;
        let mut queue = state.queue.lock().await;
        let lease = queue
            .in_flight
            .get_mut(receipt)
            .ok_or_else(|| BrokerError::UnknownReceipt(receipt.to_string()))?;
        lease.expires_at = Instant::now() + timeout;
        self.counters.extensions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn visibility_timeout(&self, bin: &MessageBin) -> Result<Duration, BrokerError> {
        Ok(self.bin(bin).await?.visibility_timeout)
    }
}
