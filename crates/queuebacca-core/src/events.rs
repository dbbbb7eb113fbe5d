// Consumption timing events surfaced to the hosting application.
use std::time::{Duration, SystemTime};

use crate::message::{MessageBin, MessageResponse};

/// Timing record for one consume attempt, emitted after the disposition
/// has been applied.
#[derive(Debug, Clone)]
pub struct TimingEvent {
    pub bin: MessageBin,
    pub message_type: &'static str,
    pub message_id: String,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub disposition: MessageResponse,
}

/// Receives engine events for a subscriber's subscriptions.
pub trait SubscriptionEventListener: Send + Sync + 'static {
    fn on_timing(&self, event: &TimingEvent);
}

/// Default listener: a structured log line plus a duration histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventListener;

impl SubscriptionEventListener for TracingEventListener {
    fn on_timing(&self, event: &TimingEvent) {
        tracing::debug!(
            bin = %event.bin,
            message_id = %event.message_id,
            message_type = event.message_type,
            duration_ms = event.duration.as_millis() as u64,
            disposition = ?event.disposition,
            "message handled"
        );
        metrics::histogram!(
            "queuebacca_consume_duration_seconds",
            "bin" => event.bin.name().to_string()
        )
        .record(event.duration.as_secs_f64());
    }
}
