//! Backoff policies, repeated-error tracking and cancellable sleeps.
//!
//! Shared by the Workload API reconnect loops and the child restart loop.

use std::fmt;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Maximum number of consecutive identical errors logged at WARN before
/// downgrading to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Bounds for an exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Initial delay before retrying.
    pub min_backoff: Duration,
    /// Maximum delay between retries.
    pub max_backoff: Duration,
}

impl BackoffConfig {
    /// Default bounds for reconnecting to the Workload API.
    pub const RECONNECT: Self = Self {
        min_backoff: Duration::from_millis(200),
        max_backoff: Duration::from_secs(10),
    };

    /// Default bounds for restarting the supervised command.
    pub const RESTART: Self = Self {
        min_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(30),
    };

    /// Swaps the bounds if `min_backoff > max_backoff`.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::RECONNECT
    }
}

/// Delay policy between consecutive restarts of the supervised command.
///
/// Injected into [`ProcessSupervisor`](crate::ProcessSupervisor) so tests can
/// drive restarts without waiting.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// Delay before the next attempt.
    fn next_delay(&mut self) -> Duration;

    /// Forgets accumulated failures.
    fn reset(&mut self);

    /// Uptime after which a child is considered healthy and the backoff is reset.
    ///
    /// `None` means the policy never throttles, so there is nothing to reset.
    fn reset_after(&self) -> Option<Duration>;

    /// Whether this policy has a backoff ceiling.
    ///
    /// Spawn failures are retried only under a throttled policy.
    fn is_throttled(&self) -> bool {
        self.reset_after().is_some()
    }
}

/// Shortest delay an [`ExponentialBackoff`] ever returns.
const MIN_THROTTLED_DELAY: Duration = Duration::from_millis(1);

/// Exponential backoff with 0-10% jitter.
///
/// Every delay is non-zero. A zero `min_backoff` is raised to
/// [`BackoffConfig::RESTART`]'s minimum, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl ExponentialBackoff {
    /// Creates a backoff bounded by `config`.
    pub fn new(config: BackoffConfig) -> Self {
        let mut config = config.normalize();
        if config.min_backoff.is_zero() {
            config.min_backoff = BackoffConfig::RESTART
                .min_backoff
                .min(config.max_backoff)
                .max(MIN_THROTTLED_DELAY);
        }
        config.max_backoff = config.max_backoff.max(config.min_backoff);
        Self {
            config,
            current: None,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.config.min_backoff,
            Some(current) => next_backoff(current, self.config.max_backoff),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn reset_after(&self) -> Option<Duration> {
        Some(self.config.max_backoff)
    }
}

/// Restarts without any delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl BackoffStrategy for Immediate {
    fn next_delay(&mut self) -> Duration {
        Duration::ZERO
    }

    fn reset(&mut self) {}

    fn reset_after(&self) -> Option<Duration> {
        None
    }
}

/// Builds the restart policy for the given bounds.
///
/// A zero `max_backoff` selects [`Immediate`].
pub fn restart_strategy(config: BackoffConfig) -> Box<dyn BackoffStrategy> {
    let config = config.normalize();
    if config.max_backoff.is_zero() {
        Box::new(Immediate)
    } else {
        Box::new(ExponentialBackoff::new(config))
    }
}

/// Allocation-free key type for error tracking categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    /// Connecting to the Workload API failed.
    Connect,
    /// Opening or reading a stream failed.
    Stream,
    /// No identity issued (expected transient state).
    NoIdentityIssued,
    /// The supervised command failed to spawn.
    Spawn,
    /// The supervised command exited.
    ChildExit,
}

/// Tracks consecutive occurrences of the same error kind so repeated failures
/// stop flooding WARN logs.
///
/// The first N consecutive occurrences of a kind should be logged at WARN,
/// later ones at DEBUG. A different kind or a [`reset`](Self::reset) restarts
/// the count.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records an error and returns whether it should be logged at WARN.
    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }

    pub(crate) fn last_error_kind(&self) -> Option<ErrorKey> {
        self.last_error_kind
    }
}

/// Sleeps for `dur` unless `token` is cancelled first. Returns `true` on cancellation.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Exponential backoff step: doubles `current`, clamps to `max` and adds
/// 0-10% jitter (still clamped to `max`).
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = (cur.saturating_mul(2)).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis((base.saturating_add(add)).min(max))
}

/// Gentler backoff for "no identity issued": 1s growing to 10s.
///
/// The workload may simply not be registered yet.
pub(crate) fn next_backoff_for_no_identity(current: Duration) -> Duration {
    const MIN_BACKOFF_MS: u64 = 1000;
    const MAX_BACKOFF_MS: u64 = 10000;

    let current_with_min = current.max(Duration::from_millis(MIN_BACKOFF_MS));
    next_backoff(current_with_min, Duration::from_millis(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_backoff_doubles_and_clamps() {
        let max = Duration::from_secs(10);
        for _ in 0..50 {
            let d = next_backoff(Duration::from_secs(1), max);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_millis(2200));

            let clamped = next_backoff(Duration::from_secs(8), max);
            assert_eq!(clamped, max);
        }
    }

    #[test]
    fn next_backoff_zero_stays_zero() {
        assert_eq!(
            next_backoff(Duration::ZERO, Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn no_identity_backoff_starts_at_one_second() {
        let d = next_backoff_for_no_identity(Duration::from_millis(10));
        assert!(d >= Duration::from_secs(2));
        assert!(d <= Duration::from_secs(10));
    }

    #[test]
    fn normalize_swaps_inverted_bounds() {
        let cfg = BackoffConfig {
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
        }
        .normalize();
        assert_eq!(cfg.min_backoff, Duration::from_secs(1));
        assert_eq!(cfg.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn exponential_starts_at_min_and_resets() {
        let mut b = ExponentialBackoff::new(BackoffConfig::RESTART);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        let second = b.next_delay();
        assert!(second >= Duration::from_secs(2));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.reset_after(), Some(Duration::from_secs(30)));
        assert!(b.is_throttled());
    }

    #[test]
    fn zero_floor_with_ceiling_never_yields_zero() {
        let mut s = restart_strategy(BackoffConfig {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(30),
        });
        assert!(s.is_throttled());
        assert_eq!(s.next_delay(), Duration::from_secs(1));
        for _ in 0..10 {
            let d = s.next_delay();
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(30));
        }

        let mut short = ExponentialBackoff::new(BackoffConfig {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::from_millis(200),
        });
        assert_eq!(short.next_delay(), Duration::from_millis(200));
        assert_eq!(short.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn zero_ceiling_selects_immediate() {
        let mut s = restart_strategy(BackoffConfig {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        });
        assert_eq!(s.next_delay(), Duration::ZERO);
        assert!(!s.is_throttled());
    }

    #[test]
    fn error_tracker_downgrades_after_threshold() {
        let mut t = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        assert!(t.record_error(ErrorKey::Connect));
        assert!(t.record_error(ErrorKey::Connect));
        assert!(t.record_error(ErrorKey::Connect));
        assert!(!t.record_error(ErrorKey::Connect));
        assert_eq!(t.consecutive_count(), 4);

        assert!(t.record_error(ErrorKey::Stream));
        assert_eq!(t.consecutive_count(), 1);
        assert_eq!(t.last_error_kind(), Some(ErrorKey::Stream));

        t.reset();
        assert_eq!(t.last_error_kind(), None);
    }

    #[tokio::test]
    async fn sleep_or_cancel_returns_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(60)).await);
    }
}
