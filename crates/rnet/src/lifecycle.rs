//! Start/Stop state machine shared by connections and servers.
//!
//! ```text
//!   start()                         stop()
//! Stopped ──▶ Starting ──▶ Started ──▶ Stopping ──▶ Stopped
//!                │ on_start            │ on_stop
//!                └─ Err: back to Stopped
//! ```
//!
//! Each transition publishes both of its states through the owned status
//! broadcaster and runs exactly one hook. Transitions on the same lifecycle
//! are serialized by an internal guard, so concurrent `start`/`stop` calls
//! from different tasks are safe; a call that finds the entity in the wrong
//! state is a no-op.
//!
//! A start-once lifecycle (used by connections, whose socket cannot be
//! reopened) refuses any `start` after the first one and closes its
//! broadcaster once stopped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use rnet_core::{LifecycleStatus, NetError, NetResult};

use crate::broadcast::{Broadcaster, Subscription};

#[derive(Debug, Default)]
struct Guarded {
    has_ever_started: bool,
}

/// Lifecycle state machine with an attached status broadcaster.
#[derive(Debug)]
pub struct Lifecycle {
    /// Entity name used in errors and logs
    kind: &'static str,
    start_once: bool,
    guard: Mutex<Guarded>,
    status: Broadcaster<LifecycleStatus>,
}

impl Lifecycle {
    /// Creates a restartable lifecycle in `Stopped`.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start_once: false,
            guard: Mutex::new(Guarded::default()),
            status: Broadcaster::replaying(LifecycleStatus::Stopped),
        }
    }

    /// Creates a lifecycle that can only be started once.
    pub fn start_once(kind: &'static str) -> Self {
        Self {
            start_once: true,
            ..Self::new(kind)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status.
    pub fn status(&self) -> LifecycleStatus {
        self.status.latest().unwrap_or_default()
    }

    /// Whether `start` has ever begun a transition.
    pub fn has_ever_started(&self) -> bool {
        self.lock().has_ever_started
    }

    /// Status stream; yields the current status first.
    pub fn subscribe(&self) -> Subscription<LifecycleStatus> {
        self.status.subscribe()
    }

    pub(crate) fn observe<F>(&self, callback: F)
    where
        F: FnMut(&LifecycleStatus) + Send + 'static,
    {
        self.status.observe(callback);
    }

    /// Runs `Stopped → Starting → Started`, calling `on_start` in between.
    ///
    /// Returns `Ok(true)` if the transition happened and `Ok(false)` if the
    /// entity was not stopped. If `on_start` fails the status returns to
    /// `Stopped` and the error is handed back.
    ///
    /// # Errors
    ///
    /// - `NetError::AlreadyStarted` for a start-once lifecycle that has
    ///   started before
    /// - whatever `on_start` returns
    pub fn start<F>(&self, on_start: F) -> NetResult<bool>
    where
        F: FnOnce() -> NetResult<()>,
    {
        let mut guarded = self.lock();

        if self.start_once && guarded.has_ever_started {
            return Err(NetError::AlreadyStarted { kind: self.kind });
        }

        if self.status() != LifecycleStatus::Stopped {
            return Ok(false);
        }

        guarded.has_ever_started = true;
        self.status.publish(LifecycleStatus::Starting);

        if let Err(e) = on_start() {
            warn!(kind = self.kind, error = %e, "Start failed, rolling back");
            self.status.publish(LifecycleStatus::Stopped);
            if self.start_once {
                self.status.close();
            }
            return Err(e);
        }

        self.status.publish(LifecycleStatus::Started);
        debug!(kind = self.kind, "Started");
        Ok(true)
    }

    /// Runs `Started → Stopping → Stopped`, calling `on_stop` in between.
    ///
    /// Returns whether the transition happened.
    pub fn stop<F>(&self, on_stop: F) -> bool
    where
        F: FnOnce(),
    {
        let _guarded = self.lock();

        if self.status() != LifecycleStatus::Started {
            return false;
        }

        self.status.publish(LifecycleStatus::Stopping);
        on_stop();
        self.status.publish(LifecycleStatus::Stopped);

        if self.start_once {
            self.status.close();
        }

        debug!(kind = self.kind, "Stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use LifecycleStatus::*;

    fn drain(mut sub: Subscription<LifecycleStatus>) -> Vec<LifecycleStatus> {
        let mut seen = Vec::new();
        while let Some(status) = sub.try_recv() {
            seen.push(status);
        }
        seen
    }

    #[tokio::test]
    async fn test_full_cycle_publishes_every_state() {
        let lifecycle = Lifecycle::new("Server");
        let sub = lifecycle.subscribe();

        assert!(lifecycle.start(|| Ok(())).unwrap());
        assert_eq!(lifecycle.status(), Started);
        assert!(lifecycle.stop(|| {}));
        assert_eq!(lifecycle.status(), Stopped);

        assert_eq!(
            drain(sub),
            vec![Stopped, Starting, Started, Stopping, Stopped]
        );
    }

    #[test]
    fn test_double_start_and_double_stop_are_noops() {
        let lifecycle = Lifecycle::new("Server");
        let starts = AtomicUsize::new(0);
        let stops = AtomicUsize::new(0);

        let on_start = || {
            starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        assert!(lifecycle.start(on_start).unwrap());
        assert!(!lifecycle
            .start(|| {
                starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap());

        assert!(lifecycle.stop(|| {
            stops.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!lifecycle.stop(|| {
            stops.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let lifecycle = Lifecycle::new("Server");
        assert!(!lifecycle.stop(|| {}));
        assert_eq!(lifecycle.status(), Stopped);
        assert!(!lifecycle.has_ever_started());
    }

    #[test]
    fn test_restartable_lifecycle_can_cycle_twice() {
        let lifecycle = Lifecycle::new("Server");
        for _ in 0..2 {
            assert!(lifecycle.start(|| Ok(())).unwrap());
            assert!(lifecycle.stop(|| {}));
        }
        assert_eq!(lifecycle.status(), Stopped);
    }

    #[tokio::test]
    async fn test_start_once_refuses_restart_and_closes_stream() {
        let lifecycle = Lifecycle::start_once("Connection");
        let mut sub = lifecycle.subscribe();

        lifecycle.start(|| Ok(())).unwrap();
        let again = lifecycle.start(|| Ok(()));
        assert!(matches!(again, Err(NetError::AlreadyStarted { .. })));

        lifecycle.stop(|| {});
        let restart = lifecycle.start(|| Ok(()));
        assert!(matches!(restart, Err(NetError::AlreadyStarted { .. })));

        let mut seen = Vec::new();
        while let Some(status) = sub.recv().await {
            seen.push(status);
        }
        assert_eq!(seen, vec![Stopped, Starting, Started, Stopping, Stopped]);

        let mut late = lifecycle.subscribe();
        assert_eq!(late.recv().await, Some(Stopped));
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_to_stopped() {
        let lifecycle = Lifecycle::new("Server");
        let sub = lifecycle.subscribe();

        let result = lifecycle.start(|| Err(NetError::Io(io::Error::new(io::ErrorKind::Other, "boom"))));
        assert!(matches!(result, Err(NetError::Io(_))));
        assert_eq!(lifecycle.status(), Stopped);
        assert_eq!(drain(sub), vec![Stopped, Starting, Stopped]);

        // A restartable entity may try again
        assert!(lifecycle.start(|| Ok(())).unwrap());
    }

    #[test]
    fn test_concurrent_stops_run_hook_once() {
        let lifecycle = Arc::new(Lifecycle::new("Server"));
        lifecycle.start(|| Ok(())).unwrap();
        let stops = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                let stops = Arc::clone(&stops);
                std::thread::spawn(move || {
                    lifecycle.stop(|| {
                        stops.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|stopped| *stopped)
            .count();

        assert_eq!(transitions, 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
