// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-consumer completions.
//!
//! [`completion`] hands back a [`Producer`] and a [`UniqueCompletion`]
//! backed by one heap cell. The producer resolves exactly once (or is
//! dropped, which resolves with the abandonment exception); the
//! consumer either takes the value, blocks for it, or chains a
//! continuation onto it with [`then`](UniqueCompletion::then).
//!
//! A continuation is a *single* allocation that is both the observer
//! attached to the source cell and the output cell of the chain — the
//! same trick the original promise machinery uses to make chaining
//! allocation-free beyond the node itself. Resolving a chain never
//! recurses: each link returns the next link to the trampoline.

use crate::cell::{
    allocate, drive, CellHeader, CellVTable, Core, CoreRef, Fire, ObserverHeader, ObserverVTable,
    Step, Tag,
};
use crate::count::{release_shared, release_unique, retain_shared, retain_unique};
use crate::exec::{ExecutorRef, Job};
use crate::loom::cell::UnsafeCell;
use crate::outcome::{Exception, Outcome};
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use static_assertions::assert_impl_all;

/// Creates a producer/consumer pair backed by a fresh, empty cell.
#[must_use]
pub fn completion<V, E>() -> (Producer<V, E>, UniqueCompletion<V, E>)
where
    V: Send + 'static,
    E: Send + 'static,
{
    let (ptr, producer_ref) = unsafe {
        // Safety: `ChannelCell` is repr(C) with its `Core` first, and
        // its vtable releases a `Box<ChannelCell<V, E>>`.
        allocate::<ChannelCell<V, E>, V, E>(ChannelCell {
            core: Core::new(&ChannelCell::<V, E>::SHARED, 2, None),
        })
    };
    // Safety: the second baked-in reference becomes the consumer handle.
    let consumer_ref = unsafe { CoreRef::adopt(ptr.cast::<Core<V, E>>()) };
    (
        Producer {
            core: Some(producer_ref),
        },
        UniqueCompletion { core: consumer_ref },
    )
}

/// A plain cell with no continuation attached to it.
#[repr(C)]
struct ChannelCell<V, E> {
    core: Core<V, E>,
}

impl<V, E> ChannelCell<V, E> {
    const SHARED: CellVTable = CellVTable {
        retain: retain_shared,
        release: release_shared::<Self>,
    };
    const UNIQUE: CellVTable = CellVTable {
        retain: retain_unique,
        release: release_unique::<Self>,
    };
}

impl<V, E> Drop for ChannelCell<V, E> {
    fn drop(&mut self) {
        // The last owner goes away only after a result existed; the
        // producer half guarantees this by resolving on drop.
        if !self.core.machine().is_resolved() {
            violation!("destroyed a completion cell that never resolved");
        }
    }
}

/// The producing half: resolves the cell exactly once.
///
/// Dropping an unresolved producer resolves the cell with the
/// [abandonment exception](Exception::abandoned) and fires the attached
/// observer's tear-down entry.
pub struct Producer<V, E> {
    core: Option<CoreRef<V, E>>,
}

impl<V, E> Producer<V, E> {
    /// Resolves the cell, delivering `outcome` to whichever observer is
    /// (or later gets) attached. Synchronous continuations run on the
    /// calling thread, driven iteratively.
    pub fn complete(mut self, outcome: Outcome<V, E>) {
        let core = self.core.take().expect("producer used twice");
        drive(Self::resolve(&core, outcome));
    }

    /// Sugar for `complete(Outcome::Value(value))`.
    pub fn complete_value(self, value: V) {
        self.complete(Outcome::Value(value));
    }

    /// Sugar for `complete(Outcome::Error(error))`.
    pub fn complete_error(self, error: E) {
        self.complete(Outcome::Error(error));
    }

    /// Resolves without driving, handing the next step back to the
    /// caller. Combinators use this to keep a single trampoline loop.
    pub(crate) fn complete_step(mut self, outcome: Outcome<V, E>) -> Step {
        let core = self.core.take().expect("producer used twice");
        Self::resolve(&core, outcome)
    }

    fn resolve(core: &CoreRef<V, E>, outcome: Outcome<V, E>) -> Step {
        // Safety: the producer half is unique and consumed by this call,
        // so the slot write happens once, before the resolve exchange.
        unsafe { core.core().store(outcome) };
        core.core().resolve(Fire::Resolved)
    }
}

impl<V, E> Drop for Producer<V, E> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            tracing::trace!(target: "handoff::unique", "producer dropped unresolved");
            // Safety: as in `resolve` — this is the producer's only
            // write.
            unsafe {
                core.core()
                    .store(Outcome::Panicked(Exception::abandoned()));
            }
            drive(core.core().resolve(Fire::Abandoned));
        }
    }
}

impl<V, E> fmt::Debug for Producer<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("resolved", &self.core.is_none())
            .finish()
    }
}

/// The consuming half of a completion: at most one observer, value
/// moved out on consumption.
pub struct UniqueCompletion<V, E> {
    core: CoreRef<V, E>,
}

assert_impl_all!(Producer<u32, ()>: Send);
assert_impl_all!(UniqueCompletion<u32, ()>: Send, Sync);

impl<V, E> UniqueCompletion<V, E> {
    /// A completion born already resolved.
    ///
    /// The backing cell has exactly one structural owner, so it uses the
    /// no-op unique counting strategy instead of atomic counting.
    #[must_use]
    pub fn ready(outcome: Outcome<V, E>) -> Self
    where
        V: Send + 'static,
        E: Send + 'static,
    {
        let (_, handle) = unsafe {
            // Safety: as in `completion`.
            allocate::<ChannelCell<V, E>, V, E>(ChannelCell {
                core: Core::ready(&ChannelCell::<V, E>::UNIQUE, 1, outcome),
            })
        };
        UniqueCompletion { core: handle }
    }

    /// `true` once the producer's write has landed.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.core.core().machine().is_resolved()
    }

    /// Takes the result if it is already there, or hands the completion
    /// back otherwise.
    ///
    /// # Errors
    ///
    /// Returns `self` when the cell is still unresolved.
    pub fn try_take(self) -> Result<Outcome<V, E>, Self> {
        if self.is_resolved() {
            Ok(self.take_resolved())
        } else {
            Err(self)
        }
    }

    /// Moves the result out. The caller must have observed resolution.
    pub(crate) fn take_resolved(self) -> Outcome<V, E> {
        debug_assert!(self.is_resolved(), "took an unresolved completion");
        // Safety: `Result` was observed with acquire ordering, and the
        // consumer half is unique, so no one else reads the slot.
        unsafe { self.core.core().take() }
    }

    pub(crate) fn header(&self) -> &CellHeader {
        &self.core.core().header
    }

    pub(crate) fn from_core(core: CoreRef<V, E>) -> Self {
        Self { core }
    }
}

impl<V, E> UniqueCompletion<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    /// Chains `f` to run synchronously, in place, on whichever thread
    /// resolves this completion (or immediately, if it already is
    /// resolved). Returns the completion of `f`'s outcome.
    pub fn then<V2, E2, F>(self, f: F) -> UniqueCompletion<V2, E2>
    where
        V2: Send + 'static,
        E2: Send + 'static,
        F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2> + Send + 'static,
    {
        ContCell::attach(self, None, f, true).expect("consumer requested")
    }

    /// Chains `f` to run on `executor`: resolution submits the
    /// continuation as a [`Job`] instead of invoking it in place.
    pub fn then_via<V2, E2, F>(self, executor: ExecutorRef, f: F) -> UniqueCompletion<V2, E2>
    where
        V2: Send + 'static,
        E2: Send + 'static,
        F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2> + Send + 'static,
    {
        ContCell::attach(self, Some(executor), f, true).expect("consumer requested")
    }

    /// Terminal synchronous continuation: runs `f` for its effects and
    /// discards the chain.
    pub fn detach<F>(self, f: F)
    where
        F: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        let _ = ContCell::attach(
            self,
            None,
            move |outcome| {
                f(outcome);
                Outcome::<(), ()>::Value(())
            },
            false,
        );
    }

    /// Terminal continuation running on `executor`.
    pub fn detach_via<F>(self, executor: ExecutorRef, f: F)
    where
        F: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        let _ = ContCell::attach(
            self,
            Some(executor),
            move |outcome| {
                f(outcome);
                Outcome::<(), ()>::Value(())
            },
            false,
        );
    }
}

#[cfg(feature = "std")]
impl<V, E> UniqueCompletion<V, E> {
    /// Parks the calling thread until the cell resolves.
    pub fn wait(&self) {
        crate::fanin::block_on_headers(&[self.header()], None);
    }

    /// Parks the calling thread until the cell resolves or `timeout`
    /// elapses; `true` means the result is ready. On expiry the waiter
    /// is unregistered and the completion stays attachable.
    pub fn wait_timeout(&self, timeout: core::time::Duration) -> bool {
        crate::fanin::block_on_headers(&[self.header()], Some(timeout))
    }

    /// Blocks until resolved, then moves the result out.
    #[must_use]
    pub fn get(self) -> Outcome<V, E> {
        self.wait();
        self.take_resolved()
    }
}

impl<V, E> fmt::Debug for UniqueCompletion<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueCompletion")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// === continuation nodes ===

/// One allocation that is both the observer attached to the source cell
/// and the output cell of the chain.
#[repr(C)]
struct ContCell<V, E, V2, E2, F> {
    /// Output cell; must be the first field so handles to it see a
    /// `Core` prefix.
    core: Core<V2, E2>,
    observer: ObserverHeader,
    source: UnsafeCell<Option<UniqueCompletion<V, E>>>,
    func: UnsafeCell<Option<F>>,
}

impl<V, E, V2, E2, F> ContCell<V, E, V2, E2, F>
where
    V: Send + 'static,
    E: Send + 'static,
    V2: Send + 'static,
    E2: Send + 'static,
    F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2> + Send + 'static,
{
    const CELL_VTABLE: CellVTable = CellVTable {
        retain: retain_shared,
        release: release_shared::<Self>,
    };

    const OBSERVER_VTABLE: ObserverVTable = ObserverVTable {
        resolved: Self::resolved,
        run: Self::run,
        abandoned: Self::abandoned,
    };

    /// Builds the node, attaches it to `source`, and returns the
    /// consumer handle for the output cell (when requested).
    fn attach(
        source: UniqueCompletion<V, E>,
        executor: Option<ExecutorRef>,
        f: F,
        with_consumer: bool,
    ) -> Option<UniqueCompletion<V2, E2>> {
        let refs = if with_consumer { 2 } else { 1 };
        let tag = if executor.is_some() {
            Tag::Call
        } else {
            Tag::Inline
        };

        let (ptr, attachment_ref) = unsafe {
            // Safety: repr(C), `Core` first, vtable releases `Box<Self>`.
            allocate::<Self, V2, E2>(ContCell {
                core: Core::new(&Self::CELL_VTABLE, refs, executor),
                observer: ObserverHeader {
                    vtable: &Self::OBSERVER_VTABLE,
                },
                source: UnsafeCell::new(Some(source)),
                func: UnsafeCell::new(Some(f)),
            })
        };
        let consumer = if with_consumer {
            // Safety: the second baked-in reference.
            Some(UniqueCompletion::from_core(unsafe {
                CoreRef::adopt(ptr.cast::<Core<V2, E2>>())
            }))
        } else {
            None
        };
        // The attachment's own reference is owned by the cell word from
        // here on; `invoke`/`abandoned` release it.
        mem::forget(attachment_ref);

        // Safety: the node is fully initialized; nothing else touches it
        // until the attach below publishes it.
        let (observer, source_header) = unsafe {
            let node = ptr.as_ref();
            let observer = NonNull::from(&node.observer);
            let source_header = node.source.with(|s| {
                NonNull::from(&(*s).as_ref().expect("source present").core.core().header)
            });
            (observer, source_header)
        };

        // Safety: `source_header` is kept alive by the handle stored in
        // the node; this is the last touch of the node on this thread.
        let attached = unsafe { source_header.as_ref() }
            .machine
            .try_attach(observer, tag);
        if !attached {
            // Already resolved: deliver here, symmetrically with the
            // attach-first ordering.
            drive(Step::Resolve(observer));
        }
        consumer
    }

    unsafe fn container(observer: NonNull<ObserverHeader>) -> NonNull<Self> {
        // Safety: `observer` points at the `observer` field of a live
        // `Self`; walking back by the field offset recovers it.
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

    unsafe fn resolved(observer: NonNull<ObserverHeader>) -> Step {
        // Safety: fired exactly once by the resolution that decoded us.
        unsafe {
            let this = Self::container(observer);
            if let Some(executor) = this.as_ref().core.executor() {
                let executor = executor.clone();
                executor.submit(Job::new(observer));
                return Step::Idle;
            }
            Self::invoke(this)
        }
    }

    unsafe fn run(observer: NonNull<ObserverHeader>) -> Step {
        // Safety: the executor honors the exactly-once job contract.
        unsafe { Self::invoke(Self::container(observer)) }
    }

    /// Consumes the source result, runs the continuation, resolves the
    /// output cell and releases the attachment's reference.
    unsafe fn invoke(this: NonNull<Self>) -> Step {
        // Safety: exactly-once invocation gives us exclusive access to
        // the node's interior.
        unsafe {
            let node = this.as_ref();
            let source = node
                .source
                .with_mut(|s| (*s).take())
                .expect("continuation fired twice");
            let func = node.func.with_mut(|f| (*f).take()).expect("func consumed");
            let outcome = source.take_resolved();

            let produced = catch_invoke(func, outcome);
            node.core.store(produced);
            let step = node.core.resolve(Fire::Resolved);

            Self::release_attachment(this);
            step
        }
    }

    unsafe fn abandoned(observer: NonNull<ObserverHeader>) -> Step {
        // Safety: as in `invoke`; the tear-down entry fires instead of
        // `resolved`, exactly once.
        unsafe {
            let this = Self::container(observer);
            let node = this.as_ref();
            drop(node.source.with_mut(|s| (*s).take()));
            drop(node.func.with_mut(|f| (*f).take()));
            node.core
                .store(Outcome::Panicked(Exception::abandoned()));
            let step = node.core.resolve(Fire::Resolved);

            Self::release_attachment(this);
            step
        }
    }

    unsafe fn release_attachment(this: NonNull<Self>) {
        let header = this.cast::<CellHeader>();
        // Safety: read the release fn before it may free the node.
        unsafe {
            let release = header.as_ref().vtable.release;
            release(header);
        }
    }
}

impl<V, E, V2, E2, F> Drop for ContCell<V, E, V2, E2, F> {
    fn drop(&mut self) {
        if !self.core.machine().is_resolved() {
            violation!("destroyed a continuation cell that never resolved");
        }
    }
}

/// Runs the continuation, converting a panic into the exception lane
/// instead of unwinding through the state machine.
fn catch_invoke<V, E, V2, E2, F>(f: F, outcome: Outcome<V, E>) -> Outcome<V2, E2>
where
    F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2>,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            match std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| f(outcome))) {
                Ok(produced) => produced,
                Err(payload) => Outcome::Panicked(Exception::from_panic(payload)),
            }
        } else {
            f(outcome)
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::{trace_init, ThreadExecutor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn resolve_then_take() {
        trace_init();
        let (producer, consumer) = completion::<u32, ()>();
        assert!(!consumer.is_resolved());
        producer.complete_value(42);
        assert!(consumer.is_resolved());
        assert_eq!(consumer.try_take().unwrap(), Outcome::Value(42));
    }

    #[test]
    fn take_before_resolve_hands_the_completion_back() {
        let (_producer, consumer) = completion::<u32, ()>();
        assert!(consumer.try_take().is_err());
    }

    #[test]
    fn chain_after_resolution_runs_immediately() {
        let (producer, consumer) = completion::<u32, ()>();
        producer.complete_value(2);
        let doubled = consumer.then(|outcome| outcome.map(|v| v * 2));
        assert_eq!(doubled.try_take().unwrap(), Outcome::Value(4));
    }

    #[test]
    fn chain_before_resolution_runs_on_the_producing_thread() {
        let (producer, consumer) = completion::<u32, ()>();
        let doubled = consumer.then(|outcome| outcome.map(|v| v * 2));
        producer.complete_value(3);
        assert_eq!(doubled.try_take().unwrap(), Outcome::Value(6));
    }

    #[test]
    fn ready_completions_chain_like_any_other() {
        let ready = UniqueCompletion::<u32, ()>::ready(Outcome::Value(10));
        assert!(ready.is_resolved());
        let bumped = ready.then(|outcome| outcome.map(|v| v + 1));
        assert_eq!(bumped.try_take().unwrap(), Outcome::Value(11));
    }

    #[test]
    fn moves_a_non_clone_value_out() {
        struct NotClone;
        let (producer, consumer) = completion::<NotClone, ()>();
        producer.complete_value(NotClone);
        assert!(consumer.try_take().is_ok());
    }

    #[test]
    fn long_inline_chain_does_not_grow_the_stack() {
        let (producer, mut consumer) = completion::<u64, ()>();
        for _ in 0..50_000 {
            consumer = consumer.then(|outcome| outcome.map(|v| v + 1));
        }
        producer.complete_value(0);
        assert_eq!(consumer.try_take().unwrap(), Outcome::Value(50_000));
    }

    #[test]
    fn dropped_producer_delivers_abandonment() {
        let (producer, consumer) = completion::<u32, ()>();
        let observed = consumer.then(|outcome| outcome);
        drop(producer);
        match observed.try_take().unwrap() {
            Outcome::Panicked(exception) => assert!(exception.is_abandoned()),
            other => panic!("expected abandonment, got {other:?}"),
        }
    }

    #[test]
    fn panicking_continuation_flows_into_the_exception_lane() {
        let (producer, consumer) = completion::<u32, ()>();
        let chained = consumer
            .then(|_: Outcome<u32, ()>| -> Outcome<u32, ()> { panic!("continuation blew up") });
        producer.complete_value(1);
        match chained.try_take().unwrap() {
            Outcome::Panicked(exception) => {
                assert_eq!(exception.message(), Some("continuation blew up"));
            }
            other => panic!("expected a panic, got {other:?}"),
        }
    }

    #[test]
    fn error_lane_passes_through_a_chain() {
        let (producer, consumer) = completion::<u32, &'static str>();
        let chained = consumer.then(|outcome| outcome.map(|v| v + 1));
        producer.complete_error("nope");
        assert_eq!(chained.try_take().unwrap(), Outcome::Error("nope"));
    }

    #[test]
    fn scheduled_continuation_runs_on_the_executor() {
        trace_init();
        let exec = ThreadExecutor::spawn();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        let (producer, consumer) = completion::<u32, ()>();
        let chained = consumer.then_via(exec.handle(), move |outcome| {
            observed.fetch_add(1, Ordering::SeqCst);
            outcome.map(|v| v * 10)
        });
        producer.complete_value(7);
        assert_eq!(chained.get(), Outcome::Value(70));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_observes_the_outcome() {
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        let (producer, consumer) = completion::<u32, ()>();
        consumer.detach(move |outcome| {
            assert_eq!(outcome, Outcome::Value(9));
            observed.fetch_add(1, Ordering::SeqCst);
        });
        producer.complete_value(9);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_get_across_threads() {
        let (producer, consumer) = completion::<u32, ()>();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(core::time::Duration::from_millis(10));
            producer.complete_value(5);
        });
        assert_eq!(consumer.get(), Outcome::Value(5));
        handle.join().unwrap();
    }

}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::atomic::Ordering;

    #[test]
    fn attach_resolve_race_delivers_exactly_once() {
        loom::model(|| {
            let (producer, consumer) = completion::<u32, ()>();
            let hits = loom::sync::Arc::new(loom::sync::atomic::AtomicUsize::new(0));
            let observed = hits.clone();

            let resolver = loom::thread::spawn(move || {
                producer.complete_value(1);
            });
            consumer.detach(move |outcome| {
                assert_eq!(outcome, Outcome::Value(1));
                observed.fetch_add(1, Ordering::SeqCst);
            });
            resolver.join().unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn wait_races_the_resolution() {
        loom::model(|| {
            let (producer, consumer) = completion::<u32, ()>();
            let resolver = loom::thread::spawn(move || {
                producer.complete_value(7);
            });
            consumer.wait();
            assert_eq!(consumer.try_take().unwrap(), Outcome::Value(7));
            resolver.join().unwrap();
        });
    }

    #[test]
    fn abandonment_races_the_attach() {
        loom::model(|| {
            let (producer, consumer) = completion::<u32, ()>();
            let dropper = loom::thread::spawn(move || drop(producer));
            let observed = consumer.then(|outcome| outcome);
            dropper.join().unwrap();
            match observed.get() {
                Outcome::Panicked(exception) => assert!(exception.is_abandoned()),
                other => panic!("expected abandonment, got {other:?}"),
            }
        });
    }
}
