// Engine defaults and tuning constants.
use std::time::Duration;

/// Default in-flight cap for a subscription.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 1;

/// Default retry delay when no generator is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long a cancelled subscription waits for already-admitted consumer
/// tasks to finish before giving up on the drain.
///
/// Rationale:
/// - Consumer code is opaque and is never interrupted mid-consume; the
///   drain is the only thing standing between `cancel()` returning and a
///   task still holding a visibility lease.
/// - A bounded wait keeps shutdown from hanging on a wedged consumer. A
///   task that outlives the grace period keeps running on the runtime and
///   still applies its disposition; the subscription just stops waiting
///   for it.
pub const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Pause after a failed retrieve before the puller polls again, so a
/// broker outage does not turn the pull loop into a hot spin.
pub const RECEIVE_FAILURE_BACKOFF: Duration = Duration::from_secs(1);
