//! Synchronous publish-subscribe bus for lifecycle signals.
//!
//! ## Rules
//! - **Ordered delivery**: `emit` calls matching subscribers in subscription order,
//!   on the emitting thread, before returning.
//! - **Snapshot per emit**: the subscriber set is read under the lock together with
//!   the history append; callbacks run after the lock is released, so a callback may
//!   itself emit, subscribe or unsubscribe.
//! - **Failure isolation**: a callback that returns `Err` or panics is logged and
//!   counted; remaining subscribers still receive the signal and `emit` never fails.
//! - **Bounded history**: the most recent `capacity` signals are kept, oldest dropped.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::signal::{Signal, SignalType};
use crate::config::DEFAULT_HISTORY_CAPACITY;
use crate::core::task::{BoxError, TaskId};
use crate::{clog_debug, clog_error, clog_trace};

/// What subscriber callbacks return.
pub type SubscriberResult = std::result::Result<(), BoxError>;

type Callback = Arc<dyn Fn(&Signal) -> SubscriberResult + Send + Sync>;

/// Capability to publish signals.
///
/// The task registry only depends on this trait, so it can be exercised
/// against a recording publisher in isolation from the bus.
pub trait Publisher: Send + Sync {
    fn publish(&self, signal: Signal);
}

struct Subscription {
    subscriber_id: String,
    signal_types: HashSet<SignalType>,
    task_filter: Option<TaskId>,
    callback: Callback,
}

impl Subscription {
    fn matches(&self, signal: &Signal) -> bool {
        if !self.signal_types.contains(&signal.signal_type) {
            return false;
        }
        match self.task_filter {
            Some(task_id) => signal.task_id == Some(task_id),
            None => true,
        }
    }
}

struct BusState {
    subscriptions: Vec<Subscription>,
    history: VecDeque<Signal>,
}

/// Filter for [`SignalBus::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub signal_type: Option<SignalType>,
    pub task_id: Option<TaskId>,
    /// At most this many signals, most recent first.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn signal_type(mut self, signal_type: SignalType) -> Self {
        self.signal_type = Some(signal_type);
        self
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, signal: &Signal) -> bool {
        self.signal_type.map_or(true, |t| signal.signal_type == t)
            && self.task_id.map_or(true, |id| signal.task_id == Some(id))
    }
}

/// Typed pub-sub bus with bounded history.
///
/// # Example
///
/// ```
/// use conductor::signals::{Signal, SignalBus, SignalType};
/// use std::collections::HashSet;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let bus = SignalBus::new(100);
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// bus.subscribe("counter", HashSet::from([SignalType::TaskCompleted]), move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(())
/// });
///
/// bus.emit(Signal::new(SignalType::TaskCompleted));
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
pub struct SignalBus {
    state: Mutex<BusState>,
    capacity: usize,
    delivery_failures: AtomicU64,
}

impl SignalBus {
    /// Create a bus keeping up to `capacity` signals of history (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BusState {
                subscriptions: Vec::new(),
                history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            }),
            capacity,
            delivery_failures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for every signal whose type is in `signal_types`.
    ///
    /// Subscribing again with the same id replaces the earlier registration
    /// in place.
    pub fn subscribe<F>(
        &self,
        subscriber_id: impl Into<String>,
        signal_types: HashSet<SignalType>,
        callback: F,
    ) where
        F: Fn(&Signal) -> SubscriberResult + Send + Sync + 'static,
    {
        self.insert(Subscription {
            subscriber_id: subscriber_id.into(),
            signal_types,
            task_filter: None,
            callback: Arc::new(callback),
        });
    }

    /// Like [`subscribe`](Self::subscribe), restricted to signals about one task.
    pub fn subscribe_filtered<F>(
        &self,
        subscriber_id: impl Into<String>,
        signal_types: HashSet<SignalType>,
        task_id: TaskId,
        callback: F,
    ) where
        F: Fn(&Signal) -> SubscriberResult + Send + Sync + 'static,
    {
        self.insert(Subscription {
            subscriber_id: subscriber_id.into(),
            signal_types,
            task_filter: Some(task_id),
            callback: Arc::new(callback),
        });
    }

    fn insert(&self, subscription: Subscription) {
        clog_debug!(
            "SignalBus::subscribe id={} types={:?} task_filter={:?}",
            subscription.subscriber_id,
            subscription.signal_types,
            subscription.task_filter
        );
        let mut state = self.lock();
        match state
            .subscriptions
            .iter_mut()
            .find(|s| s.subscriber_id == subscription.subscriber_id)
        {
            Some(existing) => *existing = subscription,
            None => state.subscriptions.push(subscription),
        }
    }

    /// Remove a registration. Returns whether one existed.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.subscriber_id != subscriber_id);
        let removed = state.subscriptions.len() < before;
        drop(state);

        if removed {
            clog_debug!("SignalBus::unsubscribe id={}", subscriber_id);
        }
        removed
    }

    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.lock()
            .subscriptions
            .iter()
            .any(|s| s.subscriber_id == subscriber_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Deliver `signal` to matching subscribers and record it in history.
    ///
    /// Returns how many callbacks completed without error.
    pub fn emit(&self, signal: Signal) -> usize {
        let targets: Vec<(String, Callback)> = {
            let mut state = self.lock();
            let targets = state
                .subscriptions
                .iter()
                .filter(|s| s.matches(&signal))
                .map(|s| (s.subscriber_id.clone(), Arc::clone(&s.callback)))
                .collect();

            if state.history.len() >= self.capacity {
                state.history.pop_front();
            }
            state.history.push_back(signal.clone());
            targets
        };

        clog_trace!(
            "SignalBus::emit type={} task={:?} subscribers={}",
            signal.signal_type,
            signal.task_id,
            targets.len()
        );

        let mut delivered = 0;
        for (subscriber_id, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(&signal))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    clog_error!(
                        "Subscriber {} failed on {}: {}",
                        subscriber_id,
                        signal.signal_type,
                        e
                    );
                }
                Err(_) => {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    clog_error!(
                        "Subscriber {} panicked on {}",
                        subscriber_id,
                        signal.signal_type
                    );
                }
            }
        }
        delivered
    }

    /// Number of callback invocations that failed or panicked so far.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Matching signals from history, most recent first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Signal> {
        let state = self.lock();
        let limit = filter.limit.unwrap_or(usize::MAX);
        state
            .history
            .iter()
            .rev()
            .filter(|s| filter.matches(s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// All retained signals, oldest first.
    pub fn history_chronological(&self) -> Vec<Signal> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
        clog_debug!("SignalBus::clear_history");
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl Publisher for SignalBus {
    fn publish(&self, signal: Signal) {
        self.emit(signal);
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SignalBus")
            .field("subscribers", &state.subscriptions.len())
            .field("history", &state.history.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
