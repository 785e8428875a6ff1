//! Circuit Breaker
//!
//! Named, reusable failure-window state machine wrapping any fallible
//! async call. CLOSED counts failures in a trailing window; OPEN rejects
//! immediately without invoking the protected call; HALF_OPEN admits
//! trial calls and closes after enough consecutive successes.
//!
//! Transitions happen under one mutex; counters are atomics so the hot
//! path never blocks on bookkeeping. The OPEN -> HALF_OPEN move is lazy:
//! it is taken the next time the state is inspected after the open
//! duration has elapsed.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that trip the circuit.
    pub failure_threshold: u32,
    /// Trailing window in which failures are counted.
    pub failure_window: Duration,
    /// How long the circuit stays open before admitting a trial call.
    pub open_duration: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold_half_open: u32,
}

impl BreakerConfig {
    /// Env overrides under `<prefix>_THRESHOLD`, `<prefix>_WINDOW_S`,
    /// `<prefix>_OPEN_S`, `<prefix>_SUCCESS`.
    pub fn from_env(prefix: &str, default: Self) -> Self {
        let get_u32 = |suffix: &str, d: u32| {
            std::env::var(format!("{prefix}_{suffix}"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d)
        };
        let get_secs = |suffix: &str, d: Duration| {
            std::env::var(format!("{prefix}_{suffix}"))
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d)
        };
        Self {
            failure_threshold: get_u32("THRESHOLD", default.failure_threshold),
            failure_window: get_secs("WINDOW_S", default.failure_window),
            open_duration: get_secs("OPEN_S", default.open_duration),
            success_threshold_half_open: get_u32("SUCCESS", default.success_threshold_half_open),
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error surfaced by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Circuit is open; the protected call was never invoked.
    Open { retry_after: Duration },
    /// The protected call ran and failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { retry_after } => {
                write!(f, "circuit open, retry in {}ms", retry_after.as_millis())
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

impl<E> BreakerError<E> {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

// =============================================================================
// OBSERVABLES
// =============================================================================

/// Atomic counter block; reads are approximate under concurrency, which
/// is fine for alerting.
#[derive(Debug, Default)]
pub struct BreakerStats {
    pub total_calls: AtomicU64,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub rejected_calls: AtomicU64,
    pub consecutive_failures: AtomicU64,
    /// Epoch millis of the most recent recorded failure / success.
    pub last_failure_ms: AtomicI64,
    pub last_success_ms: AtomicI64,
}

type StateSubscriber = Box<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

struct Core {
    state: BreakerState,
    /// Timestamps of counted failures inside the trailing window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    core: Mutex<Core>,
    subscribers: RwLock<Vec<StateSubscriber>>,
    pub stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(Core {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
            subscribers: RwLock::new(Vec::new()),
            stats: BreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Register a state-change callback. Register before putting the
    /// breaker under load; notification is best-effort outside the lock.
    pub fn on_transition(&self, cb: impl Fn(&str, BreakerState, BreakerState) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(cb));
    }

    /// Current state, taking the lazy OPEN -> HALF_OPEN transition if the
    /// open duration has elapsed.
    pub fn state(&self) -> BreakerState {
        let (state, transitioned) = {
            let mut core = self.core.lock();
            let t = self.maybe_half_open(&mut core);
            (core.state, t)
        };
        if transitioned {
            info!(breaker = %self.name, "breaker_half_open");
            self.announce(BreakerState::Open, BreakerState::HalfOpen);
        }
        state
    }

    /// Execute `f` through the breaker, counting every failure.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_filtered(f, |_| true).await
    }

    /// Execute `f` through the breaker. Failures for which `counts`
    /// returns false pass through without being recorded.
    pub async fn call_filtered<T, E, F, Fut, P>(
        &self,
        f: F,
        counts: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        if let Some(retry_after) = self.check_rejection() {
            return Err(BreakerError::Open { retry_after });
        }

        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                if counts(&e) {
                    self.record_failure();
                } else {
                    // Uncounted failure kinds still show in the failed
                    // counter but do not move the state machine.
                    self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the circuit open (maintenance).
    pub fn trip(&self) {
        let transition = {
            let mut core = self.core.lock();
            let from = core.state;
            core.state = BreakerState::Open;
            core.opened_at = Some(Instant::now());
            core.half_open_successes = 0;
            (from != BreakerState::Open).then_some((from, BreakerState::Open))
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    /// Force the circuit closed and clear the window (maintenance).
    pub fn reset(&self) {
        let transition = {
            let mut core = self.core.lock();
            let from = core.state;
            core.state = BreakerState::Closed;
            core.failures.clear();
            core.opened_at = None;
            core.half_open_successes = 0;
            (from != BreakerState::Closed).then_some((from, BreakerState::Closed))
        };
        self.stats.consecutive_failures.store(0, Ordering::Relaxed);
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    /// Returns the remaining open time when the call must be rejected.
    fn check_rejection(&self) -> Option<Duration> {
        let (rejection, transitioned) = {
            let mut core = self.core.lock();
            let t = self.maybe_half_open(&mut core);
            let r = if core.state == BreakerState::Open {
                self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
                let elapsed = core
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                Some(self.config.open_duration.saturating_sub(elapsed))
            } else {
                None
            };
            (r, t)
        };
        if transitioned {
            info!(breaker = %self.name, "breaker_half_open");
            self.announce(BreakerState::Open, BreakerState::HalfOpen);
        }
        rejection
    }

    /// Returns true when the lazy OPEN -> HALF_OPEN move was taken; the
    /// caller announces after releasing the lock.
    fn maybe_half_open(&self, core: &mut Core) -> bool {
        if core.state == BreakerState::Open {
            if let Some(opened_at) = core.opened_at {
                if opened_at.elapsed() >= self.config.open_duration {
                    core.state = BreakerState::HalfOpen;
                    core.half_open_successes = 0;
                    return true;
                }
            }
        }
        false
    }

    fn record_success(&self) {
        self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.consecutive_failures.store(0, Ordering::Relaxed);
        self.stats
            .last_success_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);

        let transition = {
            let mut core = self.core.lock();
            if core.state == BreakerState::HalfOpen {
                core.half_open_successes += 1;
                if core.half_open_successes >= self.config.success_threshold_half_open {
                    core.state = BreakerState::Closed;
                    core.failures.clear();
                    core.opened_at = None;
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, "breaker_closed");
            self.announce(from, to);
        }
    }

    fn record_failure(&self) {
        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_failure_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);

        let now = Instant::now();
        let transition = {
            let mut core = self.core.lock();
            match core.state {
                BreakerState::HalfOpen => {
                    // First failure during trial re-opens immediately.
                    core.state = BreakerState::Open;
                    core.opened_at = Some(now);
                    core.half_open_successes = 0;
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                BreakerState::Closed => {
                    core.failures.push_back(now);
                    let horizon = now - self.config.failure_window;
                    while core
                        .failures
                        .front()
                        .map(|&t| t < horizon)
                        .unwrap_or(false)
                    {
                        core.failures.pop_front();
                    }
                    if core.failures.len() as u32 >= self.config.failure_threshold {
                        core.state = BreakerState::Open;
                        core.opened_at = Some(now);
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            warn!(
                breaker = %self.name,
                failures = self.config.failure_threshold,
                window_s = self.config.failure_window.as_secs(),
                "breaker_opened"
            );
            self.announce(from, to);
        }
    }

    fn announce(&self, from: BreakerState, to: BreakerState) {
        for cb in self.subscribers.read().iter() {
            cb(&self.name, from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.core.lock().state)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering as AtomOrd},
        Arc,
    };

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_millis(500),
            open_duration: Duration::from_millis(50),
            success_threshold_half_open: 2,
        }
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(()) }).await.map(|_| ())
    }

    #[tokio::test]
    async fn opens_at_threshold() {
        let b = CircuitBreaker::new("t", fast_config());
        assert_eq!(b.state(), BreakerState::Closed);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        // Rejected without invoking the protected call.
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let r = b
            .call(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, AtomOrd::SeqCst);
                    Ok::<_, &'static str>(())
                }
            })
            .await;
        assert!(matches!(r, Err(BreakerError::Open { .. })));
        assert_eq!(called.load(AtomOrd::SeqCst), 0);
        assert_eq!(b.stats.rejected_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn half_opens_then_closes_after_successes() {
        let b = CircuitBreaker::new("t", fast_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("t", fast_config());
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn window_rolls_off_old_failures() {
        let b = CircuitBreaker::new(
            "t",
            BreakerConfig {
                failure_window: Duration::from_millis(40),
                ..fast_config()
            },
        );
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Old failures are outside the window; one more must not trip.
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn uncounted_failures_do_not_trip() {
        let b = CircuitBreaker::new("t", fast_config());
        for _ in 0..5 {
            let _ = b
                .call_filtered(|| async { Err::<(), _>("not-counted") }, |_| false)
                .await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn manual_trip_and_reset() {
        let b = CircuitBreaker::new("t", fast_config());
        b.trip();
        assert_eq!(b.state(), BreakerState::Open);
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn subscriber_sees_transitions() {
        let b = CircuitBreaker::new("t", fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        b.on_transition(move |name, from, to| {
            s.lock().push((name.to_string(), from, to));
        });
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        let events = seen.lock().clone();
        assert_eq!(
            events,
            vec![("t".to_string(), BreakerState::Closed, BreakerState::Open)]
        );
    }

    #[tokio::test]
    async fn open_error_carries_remaining_time() {
        let b = CircuitBreaker::new("t", fast_config());
        b.trip();
        match fail(&b).await {
            Err(BreakerError::Open { retry_after }) => {
                assert!(retry_after <= Duration::from_millis(50));
            }
            other => panic!("expected open rejection, got {other:?}"),
        }
    }
}
