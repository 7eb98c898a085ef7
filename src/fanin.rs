// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fan-in: reducing completion of N cells to one notification.
//!
//! Everything here follows one recipe: an atomically-decremented latch,
//! itself observer-shaped, is registered against N source cells with the
//! ordinary attach contract. The initial count carries a +1 bias so the
//! registering thread's own decrement, after registration finishes, can
//! detect "everything was already resolved" without parking. A source
//! that rejects the registration (it already holds a result) counts as
//! an immediate completion.
//!
//! Blocking waits use a stack latch: the protocol guarantees the
//! registering frame outlives every thread that can still touch the
//! latch, either because the count reached zero or because a timed-out
//! waiter [`reset`](crate::cell::Machine::reset) each source — and, when
//! a reset loses the race against an in-flight resolution, waits that
//! delivery out before returning.

pub(crate) mod when_all;
pub(crate) mod when_any;

pub use when_all::{join, when_all};
pub use when_any::{when_any, Policy};

use crate::cell::{CellHeader, ObserverHeader, ObserverVTable, Step, Tag};
use crate::loom::sync::atomic::{fence, AtomicUsize, Ordering};
use crate::park::Event;
#[cfg(feature = "std")]
use crate::park::{MutexEvent, TimedEvent};
use crate::unique::UniqueCompletion;
use core::mem;
use core::ptr::NonNull;
#[cfg(feature = "std")]
use core::time::Duration;

/// Release-decrements `counter` by `n`, reporting whether this
/// decrement brought it to exactly zero; the zero path escalates to an
/// acquire fence so everything done before the other decrements is
/// visible.
pub(crate) fn sub_eq(counter: &AtomicUsize, n: usize) -> bool {
    if counter.fetch_sub(n, Ordering::Release) == n {
        fence(Ordering::Acquire);
        true
    } else {
        false
    }
}

/// A stack-allocated fan-in latch: counter plus event.
#[repr(C, align(8))]
struct Latch<Ev> {
    observer: ObserverHeader,
    count: AtomicUsize,
    event: Ev,
}

impl<Ev: Event> Latch<Ev> {
    const VTABLE: ObserverVTable = ObserverVTable {
        resolved: Self::notified,
        run: Self::never_run,
        // A producer tear-down still resolved the source (with the
        // abandonment exception); for a waiter that is a completion.
        abandoned: Self::notified,
    };

    fn new(count: usize) -> Self {
        Self {
            observer: ObserverHeader {
                vtable: &Self::VTABLE,
            },
            count: AtomicUsize::new(count),
            event: Ev::default(),
        }
    }

    fn observer_ptr(&self) -> NonNull<ObserverHeader> {
        NonNull::from(&self.observer)
    }

    fn sub_eq(&self, n: usize) -> bool {
        sub_eq(&self.count, n)
    }

    unsafe fn notified(observer: NonNull<ObserverHeader>) -> Step {
        // Safety: the resolution that decoded us holds the single right
        // to this notification; the latch outlives it by protocol.
        let this = unsafe {
            &*observer
                .as_ptr()
                .cast::<u8>()
                .sub(mem::offset_of!(Self, observer))
                .cast::<Self>()
        };
        if this.sub_eq(1) {
            this.event.set();
        }
        Step::Idle
    }

    unsafe fn never_run(_observer: NonNull<ObserverHeader>) -> Step {
        violation!("a blocking waiter was submitted to an executor");
    }
}

/// Registers the latch against every cell, returning how many
/// registrations actually landed (the rest were already resolved).
fn register<Ev: Event>(latch: &Latch<Ev>, cells: &[&CellHeader], tag: Tag) -> usize {
    let mut wait_count = 0;
    for cell in cells {
        if cell.machine.is_empty() && cell.machine.try_attach(latch.observer_ptr(), tag) {
            wait_count += 1;
        }
    }
    wait_count
}

/// Parks until every cell is resolved.
pub(crate) fn wait_headers<Ev: Event>(cells: &[&CellHeader]) {
    let n = cells.len();
    if n == 0 {
        return;
    }
    // +1 bias: our own decrement below detects "all already resolved"
    // without ever notifying the event.
    let latch = Latch::<Ev>::new(n + 1);
    let wait_count = register(&latch, cells, Tag::WaitPinned);
    if wait_count == 0 || latch.sub_eq(n - wait_count + 1) {
        return;
    }
    latch.event.wait();
}

/// Parks until every cell is resolved or `timeout` elapses; `true`
/// means everything resolved.
///
/// On expiry each source is reset. A source whose reset fails resolved
/// concurrently; its in-flight notification is waited out before the
/// latch goes out of scope.
#[cfg(feature = "std")]
pub(crate) fn wait_headers_timeout<Ev: TimedEvent>(cells: &[&CellHeader], timeout: Duration) -> bool {
    let n = cells.len();
    if n == 0 {
        return true;
    }
    let latch = Latch::<Ev>::new(n + 1);
    let wait_count = register(&latch, cells, Tag::WaitTimed);
    if wait_count == 0 || latch.sub_eq(n - wait_count + 1) {
        return true;
    }
    if latch.event.wait_timeout(timeout) {
        return true;
    }

    let mut reset_count = 0;
    for cell in cells {
        if cell.machine.reset() {
            reset_count += 1;
        }
    }
    if reset_count != 0 && (reset_count == wait_count || latch.sub_eq(reset_count)) {
        // Every registration was either unregistered or already
        // notified; no one can touch the latch anymore.
        return false;
    }
    // Some notification is still in flight; wait it out so the latch
    // may be freed, then report whether we actually saw everything.
    latch.event.wait();
    reset_count == 0
}

#[cfg(feature = "std")]
pub(crate) fn block_on_headers(cells: &[&CellHeader], timeout: Option<Duration>) -> bool {
    match timeout {
        None => {
            wait_headers::<MutexEvent>(cells);
            true
        }
        #[cfg(not(loom))]
        Some(timeout) => wait_headers_timeout::<MutexEvent>(cells, timeout),
        #[cfg(loom)]
        Some(_) => unreachable!("loom does not model timed waits"),
    }
}

mod sealed {
    use crate::cell::CellHeader;

    pub trait Sealed {
        fn cell_header(&self) -> &CellHeader;
    }
}

/// Something a blocking fan-in wait can be registered against.
pub trait Waitable: sealed::Sealed {}

impl<V, E> sealed::Sealed for UniqueCompletion<V, E> {
    fn cell_header(&self) -> &CellHeader {
        self.header()
    }
}

impl<V, E> Waitable for UniqueCompletion<V, E> {}

/// Parks the calling thread until every item is resolved, blocking on a
/// caller-chosen [`Event`] implementation. This is the `no_std` entry
/// point; with `std`, [`wait_all`] picks the mutex-backed event.
pub fn wait_all_with<'a, Ev: Event>(items: impl IntoIterator<Item = &'a dyn Waitable>) {
    let headers: alloc::vec::Vec<&CellHeader> =
        items.into_iter().map(|item| item.cell_header()).collect();
    wait_headers::<Ev>(&headers);
}

/// Parks the calling thread until every item is resolved.
#[cfg(feature = "std")]
pub fn wait_all<'a>(items: impl IntoIterator<Item = &'a dyn Waitable>) {
    let headers: alloc::vec::Vec<&CellHeader> =
        items.into_iter().map(|item| item.cell_header()).collect();
    block_on_headers(&headers, None);
}

/// Parks until every item is resolved or `timeout` elapses; `true`
/// means everything resolved. On expiry every still-pending item is
/// left attachable.
#[cfg(feature = "std")]
pub fn wait_all_timeout<'a>(
    items: impl IntoIterator<Item = &'a dyn Waitable>,
    timeout: Duration,
) -> bool {
    let headers: alloc::vec::Vec<&CellHeader> =
        items.into_iter().map(|item| item.cell_header()).collect();
    block_on_headers(&headers, Some(timeout))
}

// === WaitGroup ===

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use crate::loom::sync::atomic::AtomicBool;
        use alloc::boxed::Box;

        /// A reusable fan-in counter: tracks explicit [`add`](Self::add)
        /// / [`done`](Self::done) pairs and attached completions, and
        /// parks [`wait`](Self::wait)ers until the count drains.
        ///
        /// The group's latch is heap-allocated and reference-counted by
        /// its pending attachments, so dropping the `WaitGroup` handle
        /// while sources are still pending is safe: the latch stays
        /// alive until the last notification lands.
        pub struct WaitGroup<Ev: Event = MutexEvent> {
            inner: NonNull<GroupInner<Ev>>,
        }

        #[repr(C, align(8))]
        struct GroupInner<Ev> {
            observer: ObserverHeader,
            /// Outstanding work items, biased by 1 for the waiter.
            tasks: AtomicUsize,
            /// Memory references: the handle plus pending attachments.
            refs: AtomicUsize,
            waited: AtomicBool,
            event: Ev,
        }

        // Safety: the interior is atomics plus a `Sync` event.
        unsafe impl<Ev: Event> Send for WaitGroup<Ev> {}
        unsafe impl<Ev: Event> Sync for WaitGroup<Ev> {}

        impl<Ev: Event> GroupInner<Ev> {
            const VTABLE: ObserverVTable = ObserverVTable {
                resolved: Self::notified,
                run: Self::never_run,
                abandoned: Self::notified,
            };

            unsafe fn container(observer: NonNull<ObserverHeader>) -> NonNull<Self> {
                // Safety: `observer` is the first field of a live `Self`.
                unsafe {
                    NonNull::new_unchecked(
                        observer
                            .as_ptr()
                            .cast::<u8>()
                            .sub(mem::offset_of!(Self, observer))
                            .cast::<Self>(),
                    )
                }
            }

            unsafe fn notified(observer: NonNull<ObserverHeader>) -> Step {
                // Safety: exactly-once per attachment; the attachment
                // holds a reference released below.
                unsafe {
                    let this = Self::container(observer);
                    this.as_ref().done_one();
                    Self::release(this);
                }
                Step::Idle
            }

            unsafe fn never_run(_observer: NonNull<ObserverHeader>) -> Step {
                violation!("a wait group was submitted to an executor");
            }

            fn done_one(&self) {
                if sub_eq(&self.tasks, 1) {
                    self.event.set();
                }
            }

            unsafe fn release(this: NonNull<Self>) {
                // Safety: liveness promised by the caller.
                if unsafe { this.as_ref() }.refs.fetch_sub(1, Ordering::Release) == 1 {
                    fence(Ordering::Acquire);
                    // Safety: last reference.
                    drop(unsafe { Box::from_raw(this.as_ptr()) });
                }
            }
        }

        impl<Ev: Event> WaitGroup<Ev> {
            /// An empty group. The internal count starts with the
            /// waiter's bias, consumed by the first [`wait`](Self::wait).
            #[must_use]
            pub fn new() -> Self {
                let inner = NonNull::from(Box::leak(Box::new(GroupInner {
                    observer: ObserverHeader {
                        vtable: &GroupInner::<Ev>::VTABLE,
                    },
                    tasks: AtomicUsize::new(1),
                    refs: AtomicUsize::new(1),
                    waited: AtomicBool::new(false),
                    event: Ev::default(),
                })));
                Self { inner }
            }

            fn inner(&self) -> &GroupInner<Ev> {
                // Safety: the handle's reference keeps it alive.
                unsafe { self.inner.as_ref() }
            }

            /// Registers `n` units of work to be balanced by
            /// [`done`](Self::done) calls.
            pub fn add(&self, n: usize) {
                let prev = self.inner().tasks.fetch_add(n, Ordering::Relaxed);
                debug_assert!(prev >= 1, "added to a drained wait group");
            }

            /// Marks one unit of work finished.
            pub fn done(&self) {
                self.inner().done_one();
            }

            /// Counts `completion` as one unit of work, finished when it
            /// resolves. A completion that already resolved is counted
            /// immediately and never parks anyone.
            pub fn attach<V, E>(&self, completion: &UniqueCompletion<V, E>) {
                self.add(1);
                let inner = self.inner();
                inner.refs.fetch_add(1, Ordering::Relaxed);
                let machine = &completion.header().machine;
                if machine.is_empty()
                    && machine.try_attach(NonNull::from(&inner.observer), Tag::WaitPinned)
                {
                    return;
                }
                // Already resolved: the attachment never happened.
                inner.refs.fetch_sub(1, Ordering::Relaxed);
                inner.done_one();
            }

            /// Parks until the count drains. The first waiter consumes
            /// the constructor's bias.
            pub fn wait(&self) {
                let inner = self.inner();
                if !inner.waited.swap(true, Ordering::AcqRel) {
                    inner.done_one();
                }
                inner.event.wait();
            }

            /// Rearms a drained group for another round.
            ///
            /// Only sound once [`wait`](Self::wait) returned and before
            /// any new work is registered elsewhere.
            pub fn reset(&self) {
                let inner = self.inner();
                inner.event.reset();
                inner.tasks.store(1, Ordering::Relaxed);
                inner.waited.store(false, Ordering::Relaxed);
            }
        }

        impl<Ev: Event> Default for WaitGroup<Ev> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<Ev: Event> Drop for WaitGroup<Ev> {
            fn drop(&mut self) {
                // Safety: the handle's own reference.
                unsafe { GroupInner::release(self.inner) };
            }
        }

        impl<Ev: Event> core::fmt::Debug for WaitGroup<Ev> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_struct("WaitGroup")
                    .field("tasks", &self.inner().tasks.load(Ordering::Relaxed))
                    .finish()
            }
        }
    }
}
