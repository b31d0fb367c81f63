//! In-process fan-out of values to many observers.
//!
//! A [`Broadcaster`] keeps a set of sinks and pushes every published value to
//! each of them, in publish order. Two flavours exist:
//!
//! - **replaying** ([`Broadcaster::replaying`]): caches the latest value, hands
//!   it to every new subscriber first, and suppresses consecutive duplicates.
//!   Used for lifecycle status.
//! - **hot** ([`Broadcaster::new`]): no cache; subscribers only see values
//!   published after they subscribed. Used for data and client events.
//!
//! Publishing never blocks on a subscriber: channel sinks are unbounded and a
//! dropped [`Subscription`] is pruned on the next publish. Once
//! [`Broadcaster::close`] has run, every subscription completes and later
//! subscribers of a replaying broadcaster get the final value followed by
//! completion.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered with `PoisonError::into_inner`

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Observer invoked synchronously on every published value.
type Callback<T> = Box<dyn FnMut(&T) + Send>;

enum Sink<T> {
    Channel(mpsc::UnboundedSender<T>),
    Callback(Callback<T>),
}

impl<T> Sink<T> {
    fn is_alive(&self) -> bool {
        match self {
            Sink::Channel(tx) => !tx.is_closed(),
            Sink::Callback(_) => true,
        }
    }
}

struct State<T> {
    latest: Option<T>,
    sinks: Vec<Sink<T>>,
    closed: bool,
}

/// Multicast notification channel.
///
/// Every published value reaches every live sink exactly once and in order.
pub struct Broadcaster<T> {
    state: Mutex<State<T>>,
    replay: bool,
    same: Option<fn(&T, &T) -> bool>,
}

impl<T> Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a hot broadcaster without a value cache.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                latest: None,
                sinks: Vec::new(),
                closed: false,
            }),
            replay: false,
            same: None,
        }
    }

    /// Creates a broadcaster that replays its latest value to new subscribers
    /// and drops values equal to the one before.
    pub fn replaying(initial: T) -> Self
    where
        T: PartialEq,
    {
        Self {
            state: Mutex::new(State {
                latest: Some(initial),
                sinks: Vec::new(),
                closed: false,
            }),
            replay: true,
            same: Some(<T as PartialEq>::eq),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes a new channel observer.
    ///
    /// On a replaying broadcaster the current value is queued first. After
    /// close, the subscription yields that value (if any) and then ends.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        if self.replay {
            if let Some(latest) = state.latest.clone() {
                // Receiver is alive, send cannot fail here
                let _ = tx.send(latest);
            }
        }

        if !state.closed {
            state.sinks.push(Sink::Channel(tx));
        }

        Subscription { rx }
    }

    /// Registers a callback observer.
    ///
    /// The callback runs on the publisher's thread while the broadcaster is
    /// locked, so it must be short and must not touch this broadcaster. On a
    /// replaying broadcaster it is invoked once immediately with the current
    /// value.
    pub(crate) fn observe<F>(&self, mut callback: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        let mut state = self.lock();

        if self.replay {
            if let Some(latest) = state.latest.as_ref() {
                callback(latest);
            }
        }

        if !state.closed {
            state.sinks.push(Sink::Callback(Box::new(callback)));
        }
    }

    /// Delivers a value to every live sink.
    ///
    /// Ignored after close, and ignored on a replaying broadcaster when equal
    /// to the cached value. Returns whether the value was delivered.
    pub fn publish(&self, value: T) -> bool {
        let mut state = self.lock();

        if state.closed {
            return false;
        }

        if self.replay {
            if let (Some(same), Some(latest)) = (self.same, state.latest.as_ref()) {
                if same(latest, &value) {
                    return false;
                }
            }
            state.latest = Some(value.clone());
        }

        state.sinks.retain_mut(|sink| match sink {
            Sink::Channel(tx) => tx.send(value.clone()).is_ok(),
            Sink::Callback(callback) => {
                callback(&value);
                true
            }
        });

        true
    }

    /// Completes every subscription and refuses further values.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sinks.clear();
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns the cached value of a replaying broadcaster.
    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    /// Number of live sinks; dropped subscriptions are released here.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.sinks.retain(Sink::is_alive);
        state.sinks.len()
    }
}

impl<T> Default for Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("replay", &self.replay)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Receiving end of a broadcaster subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Waits for the next value; `None` once the broadcaster has closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns an already-queued value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Skips values until one matches the predicate.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(value) = self.rx.recv().await {
            if predicate(&value) {
                return Some(value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_late_subscriber_gets_current_value() {
        let broadcaster = Broadcaster::replaying(1u32);
        broadcaster.publish(2);
        broadcaster.publish(3);

        let mut sub = broadcaster.subscribe();
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.try_recv(), None);

        broadcaster.publish(4);
        assert_eq!(sub.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_consecutive_duplicates_suppressed() {
        let broadcaster = Broadcaster::replaying(0u32);
        let mut sub = broadcaster.subscribe();

        assert!(broadcaster.publish(1));
        assert!(!broadcaster.publish(1));
        assert!(broadcaster.publish(2));
        assert!(broadcaster.publish(1));
        broadcaster.close();

        let mut seen = Vec::new();
        while let Some(v) = sub.recv().await {
            seen.push(v);
        }
        assert_eq!(seen, vec![0, 1, 2, 1]);
    }

    #[tokio::test]
    async fn test_hot_broadcaster_does_not_replay() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish("before");

        let mut sub = broadcaster.subscribe();
        assert_eq!(sub.try_recv(), None);

        broadcaster.publish("after");
        assert_eq!(sub.recv().await, Some("after"));
        assert_eq!(broadcaster.latest(), None);
    }

    #[tokio::test]
    async fn test_close_completes_subscribers() {
        let broadcaster = Broadcaster::replaying(7u8);
        let mut early = broadcaster.subscribe();
        broadcaster.close();

        assert_eq!(early.recv().await, Some(7));
        assert_eq!(early.recv().await, None);

        assert!(!broadcaster.publish(8));
        let mut late = broadcaster.subscribe();
        assert_eq!(late.recv().await, Some(7));
        assert_eq!(late.recv().await, None);
        assert!(broadcaster.is_closed());
    }

    #[test]
    fn test_dropped_subscribers_are_released() {
        let broadcaster = Broadcaster::<u8>::new();
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(a);
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(b);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_observer_sees_replay_and_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = Broadcaster::replaying(10u32);

        let sink = Arc::clone(&seen);
        broadcaster.observe(move |v| sink.lock().unwrap().push(*v));
        broadcaster.publish(11);
        broadcaster.publish(11);
        broadcaster.publish(12);

        assert_eq!(*seen.lock().unwrap(), vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order_for_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut subs: Vec<_> = (0..4).map(|_| broadcaster.subscribe()).collect();

        for i in 0..100u32 {
            broadcaster.publish(i);
        }
        broadcaster.close();

        for sub in subs.iter_mut() {
            let mut expected = 0;
            while let Some(v) = sub.recv().await {
                assert_eq!(v, expected);
                expected += 1;
            }
            assert_eq!(expected, 100);
        }
    }
}
