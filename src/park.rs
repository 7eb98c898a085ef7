// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blockable-thread collaborator contract.
//!
//! Blocking waits park on an [`Event`]: a one-shot (resettable) ready
//! flag that any thread may [`set`](Event::set), including concurrently
//! with the waiter being torn down — the fan-in protocol guarantees the
//! event outlives every thread that can still touch it. Because the
//! flag persists, there is no lost-wakeup window between registering
//! interest and parking; a `set` that happens first makes the next
//! `wait` return immediately.

use core::time::Duration;

/// A parkable rendezvous point between one waiter and many notifiers.
pub trait Event: Send + Sync + Default {
    /// Blocks the calling thread until [`set`](Event::set) was called.
    fn wait(&self);

    /// Makes current and future [`wait`](Event::wait) calls return.
    /// Safe to call from any thread.
    fn set(&self);

    /// Rearms the event. Only sound while no thread is waiting.
    fn reset(&self);
}

/// An [`Event`] that can also bound its wait by a timeout.
pub trait TimedEvent: Event {
    /// Blocks until set or until `timeout` elapses; `true` means the
    /// event was set.
    fn wait_timeout(&self, timeout: Duration) -> bool;
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use crate::loom::sync::{Condvar, Mutex};

        /// OS-backed event: a mutex/condvar pair around a ready flag.
        pub struct MutexEvent {
            ready: Mutex<bool>,
            cv: Condvar,
        }

        impl Default for MutexEvent {
            fn default() -> Self {
                Self {
                    ready: Mutex::new(false),
                    cv: Condvar::new(),
                }
            }
        }

        impl core::fmt::Debug for MutexEvent {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.pad("MutexEvent")
            }
        }

        impl Event for MutexEvent {
            fn wait(&self) {
                let mut ready = self.ready.lock().unwrap();
                while !*ready {
                    ready = self.cv.wait(ready).unwrap();
                }
            }

            fn set(&self) {
                let mut ready = self.ready.lock().unwrap();
                *ready = true;
                // Notify while holding the lock: the waiter cannot be
                // torn down between our flag write and the notify.
                self.cv.notify_all();
            }

            fn reset(&self) {
                *self.ready.lock().unwrap() = false;
            }
        }

        #[cfg(not(loom))]
        impl TimedEvent for MutexEvent {
            fn wait_timeout(&self, timeout: Duration) -> bool {
                let deadline = std::time::Instant::now() + timeout;
                let mut ready = self.ready.lock().unwrap();
                while !*ready {
                    let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
                    else {
                        return false;
                    };
                    let (guard, _timed_out) = self.cv.wait_timeout(ready, remaining).unwrap();
                    ready = guard;
                }
                true
            }
        }
    }
}

/// Spin-wait event for targets without OS parking. Wasteful under
/// contention; prefer [`MutexEvent`] where `std` is available.
#[derive(Debug, Default)]
pub struct SpinEvent {
    ready: core::sync::atomic::AtomicBool,
}

impl Event for SpinEvent {
    fn wait(&self) {
        while !self.ready.load(core::sync::atomic::Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    fn set(&self) {
        self.ready.store(true, core::sync::atomic::Ordering::Release);
    }

    fn reset(&self) {
        self.ready
            .store(false, core::sync::atomic::Ordering::Release);
    }
}

#[cfg(all(test, feature = "std", not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn set_before_wait_returns_immediately() {
        let event = MutexEvent::default();
        event.set();
        event.wait();
    }

    #[test]
    fn cross_thread_wakeup() {
        let event = Arc::new(MutexEvent::default());
        let notifier = event.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            notifier.set();
        });
        event.wait();
        handle.join().unwrap();
    }

    #[test]
    fn timeout_expires_without_a_set() {
        let event = MutexEvent::default();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn reset_rearms() {
        let event = MutexEvent::default();
        event.set();
        event.wait();
        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn spin_event_basically_works() {
        let event = Arc::new(SpinEvent::default());
        let notifier = event.clone();
        let handle = std::thread::spawn(move || notifier.set());
        event.wait();
        handle.join().unwrap();
    }
}
