// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-subscriber completions.
//!
//! A broadcast cell keeps its own intrusive list of pending subscribers
//! in a second atomic word, separate from the single-observer machinery:
//! a list cannot be packed into one tagged pointer. Subscribing pushes
//! onto the list with a CAS loop unless the head already holds the
//! sealed sentinel, in which case the value is read directly.
//! Resolution writes the slot, swaps the head to the sealed sentinel and
//! walks the captured nodes, completing each subscriber's bridge cell
//! with a copy of the value through the trampoline.
//!
//! Every subscriber is a bridge to a fresh [`UniqueCompletion`]
//! ([`BroadcastCompletion::fork`]); chaining and blocking derive from
//! that, so the broadcast cell itself stays small.

use crate::cell::drive;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{fence, AtomicUsize, Ordering};
use crate::outcome::{Exception, Outcome};
use crate::unique::{completion, Producer, UniqueCompletion};
use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use static_assertions::assert_impl_all;

/// List-head sentinel meaning "resolved": no further subscriptions are
/// accepted and the slot may be read.
const SEALED: usize = usize::MAX;

/// Creates a broadcast producer and the first subscriber handle.
#[must_use]
pub fn broadcast<V, E>() -> (BroadcastProducer<V, E>, BroadcastCompletion<V, E>)
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let cell = NonNull::from(Box::leak(Box::new(SharedCell::<V, E> {
        // One reference for each returned handle.
        count: AtomicUsize::new(2),
        head: AtomicUsize::new(0),
        slot: UnsafeCell::new(None),
        _marker: PhantomData,
    })));
    (
        BroadcastProducer { cell: Some(cell) },
        BroadcastCompletion { cell },
    )
}

struct SharedCell<V, E> {
    count: AtomicUsize,
    /// Null, a `*mut SharedNode`, or [`SEALED`].
    head: AtomicUsize,
    slot: UnsafeCell<Option<Outcome<V, E>>>,
    _marker: PhantomData<(V, E)>,
}

/// A pending subscriber: a bridge completing one unique cell with a
/// copy of the broadcast value.
struct SharedNode<V, E> {
    next: *mut SharedNode<V, E>,
    producer: Producer<V, E>,
}

impl<V, E> SharedCell<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Registers `producer` to be completed with a copy of the value;
    /// completes it right away when the cell is already sealed.
    fn attach(&self, producer: Producer<V, E>) {
        let node = Box::into_raw(Box::new(SharedNode {
            next: ptr::null_mut(),
            producer,
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == SEALED {
                // Safety: we just created `node` and it was never
                // published.
                let node = unsafe { Box::from_raw(node) };
                // Safety: the seal was observed with acquire ordering,
                // so the slot write is visible.
                let outcome = unsafe { self.read() };
                drive(node.producer.complete_step(outcome));
                return;
            }
            // Safety: `node` is unpublished until the CAS below
            // succeeds.
            unsafe { (*node).next = head as *mut SharedNode<V, E> };
            match self.head.compare_exchange_weak(
                head,
                node as usize,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Stores the value, seals the list and delivers a copy to every
    /// captured subscriber.
    fn seal(&self, outcome: Outcome<V, E>) {
        self.slot.with_mut(|slot| {
            // Safety: the producer half is unique and consumed by the
            // caller; subscribers read only after the seal below.
            let slot = unsafe { &mut *slot };
            debug_assert!(slot.is_none(), "broadcast slot written twice");
            *slot = Some(outcome);
        });

        let head = self.head.swap(SEALED, Ordering::AcqRel);
        if head == SEALED {
            violation!("broadcast completion resolved twice");
        }
        tracing::trace!(target: "handoff::broadcast", "sealed");

        let mut node_ptr = head as *mut SharedNode<V, E>;
        while !node_ptr.is_null() {
            // Safety: the seal exchange took exclusive ownership of the
            // whole captured list.
            let node = unsafe { Box::from_raw(node_ptr) };
            node_ptr = node.next;
            // Safety: we are the sealer; the slot is ours to copy from.
            let outcome = unsafe { self.read() };
            drive(node.producer.complete_step(outcome));
        }
    }

    /// Copies the stored value.
    ///
    /// # Safety
    ///
    /// The caller must have observed the seal with acquire ordering.
    unsafe fn read(&self) -> Outcome<V, E> {
        self.slot.with(|slot| {
            // Safety: promised by the caller; the slot is never written
            // after the seal.
            match unsafe { (*slot).clone() } {
                Some(outcome) => outcome,
                None => violation!("read a broadcast cell that holds no result"),
            }
        })
    }
}

impl<V, E> SharedCell<V, E> {
    fn is_sealed(&self) -> bool {
        self.head.load(Ordering::Acquire) == SEALED
    }

    unsafe fn retain(cell: NonNull<Self>) {
        // Safety: liveness promised by the caller.
        let prev = unsafe { cell.as_ref() }.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev >= 1);
    }

    unsafe fn release(cell: NonNull<Self>) {
        // Safety: liveness promised by the caller.
        if unsafe { cell.as_ref() }.count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            // Safety: last reference; the producer released its own
            // reference only after sealing, so the list head is sealed
            // and no node pointers are outstanding.
            let cell = unsafe { Box::from_raw(cell.as_ptr()) };
            if !cell.is_sealed() {
                violation!("destroyed a broadcast cell that never resolved");
            }
        }
    }
}

/// The producing half of a broadcast completion.
///
/// Dropping it unresolved seals the cell with the abandonment
/// exception.
pub struct BroadcastProducer<V, E> {
    cell: Option<NonNull<SharedCell<V, E>>>,
}

// Safety: the cell interior is handed between threads only through the
// seal/CAS protocol on the head word.
unsafe impl<V: Send + Sync, E: Send + Sync> Send for BroadcastProducer<V, E> {}
unsafe impl<V: Send + Sync, E: Send + Sync> Sync for BroadcastProducer<V, E> {}

impl<V, E> BroadcastProducer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Resolves the broadcast, copying `outcome` to every subscriber.
    pub fn complete(mut self, outcome: Outcome<V, E>) {
        let cell = self.cell.take().expect("producer used twice");
        // Safety: the handle keeps the cell alive.
        unsafe { cell.as_ref() }.seal(outcome);
        // Safety: this producer's reference.
        unsafe { SharedCell::release(cell) };
    }

    /// Sugar for `complete(Outcome::Value(value))`.
    pub fn complete_value(self, value: V) {
        self.complete(Outcome::Value(value));
    }
}

impl<V, E> Drop for BroadcastProducer<V, E> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            tracing::trace!(target: "handoff::broadcast", "producer dropped unresolved");
            // A dropped producer still seals, so subscribers observe the
            // abandonment instead of hanging.
            // Safety: as in `complete`; `Clone`/`Send` bounds were
            // enforced at construction.
            unsafe {
                cell.as_ref().seal_abandoned();
                SharedCell::release(cell);
            }
        }
    }
}

impl<V, E> SharedCell<V, E> {
    /// Seal with the abandonment exception. Split out so `Drop` does not
    /// need the `Clone` bounds the value path needs.
    unsafe fn seal_abandoned(&self) {
        self.slot.with_mut(|slot| {
            // Safety: the producer half is unique; see `seal`.
            let slot = unsafe { &mut *slot };
            debug_assert!(slot.is_none());
            *slot = Some(Outcome::Panicked(Exception::abandoned()));
        });
        let head = self.head.swap(SEALED, Ordering::AcqRel);
        debug_assert_ne!(head, SEALED);

        let mut node_ptr = head as *mut SharedNode<V, E>;
        while !node_ptr.is_null() {
            // Safety: the seal exchange owns the captured list.
            let node = unsafe { Box::from_raw(node_ptr) };
            node_ptr = node.next;
            drive(
                node.producer
                    .complete_step(Outcome::Panicked(Exception::abandoned())),
            );
        }
    }
}

impl<V, E> fmt::Debug for BroadcastProducer<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastProducer")
            .field("resolved", &self.cell.is_none())
            .finish()
    }
}

/// A subscriber handle to a broadcast completion. Cloning is cheap; any
/// number of handles may subscribe or read independently.
pub struct BroadcastCompletion<V, E> {
    cell: NonNull<SharedCell<V, E>>,
}

assert_impl_all!(BroadcastCompletion<u32, ()>: Send, Sync);

// Safety: as for the producer.
unsafe impl<V: Send + Sync, E: Send + Sync> Send for BroadcastCompletion<V, E> {}
unsafe impl<V: Send + Sync, E: Send + Sync> Sync for BroadcastCompletion<V, E> {}

impl<V, E> BroadcastCompletion<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Bridges this broadcast into a fresh single-consumer completion
    /// that resolves with a copy of the value.
    #[must_use]
    pub fn fork(&self) -> UniqueCompletion<V, E> {
        let (producer, consumer) = completion();
        // Safety: the handle keeps the cell alive.
        unsafe { self.cell.as_ref() }.attach(producer);
        consumer
    }

    /// Copies the value out, if the broadcast already resolved.
    #[must_use]
    pub fn try_get(&self) -> Option<Outcome<V, E>> {
        let cell = unsafe { self.cell.as_ref() };
        if cell.is_sealed() {
            // Safety: seal observed with acquire ordering.
            Some(unsafe { cell.read() })
        } else {
            None
        }
    }

    /// Chains `f` onto a copy of the broadcast value.
    pub fn then<V2, E2, F>(&self, f: F) -> UniqueCompletion<V2, E2>
    where
        V2: Send + 'static,
        E2: Send + 'static,
        F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2> + Send + 'static,
    {
        self.fork().then(f)
    }

    /// Runs `f` with a copy of the value once resolved.
    pub fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        self.fork().detach(f);
    }

    /// `true` once the broadcast resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        unsafe { self.cell.as_ref() }.is_sealed()
    }
}

#[cfg(feature = "std")]
impl<V, E> BroadcastCompletion<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Parks the calling thread until the broadcast resolves.
    pub fn wait(&self) {
        if !self.is_resolved() {
            self.fork().wait();
        }
    }

    /// Blocks until resolved, then copies the value out.
    #[must_use]
    pub fn get(&self) -> Outcome<V, E> {
        self.wait();
        self.try_get().expect("resolved after wait")
    }
}

impl<V, E> Clone for BroadcastCompletion<V, E> {
    fn clone(&self) -> Self {
        // Safety: this handle's reference keeps the cell alive.
        unsafe { SharedCell::retain(self.cell) };
        Self { cell: self.cell }
    }
}

impl<V, E> Drop for BroadcastCompletion<V, E> {
    fn drop(&mut self) {
        // Safety: this handle's reference.
        unsafe { SharedCell::release(self.cell) };
    }
}

impl<V, E> fmt::Debug for BroadcastCompletion<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastCompletion")
            .field("resolved", &unsafe { self.cell.as_ref() }.is_sealed())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn every_pre_seal_subscriber_runs_once() {
        let (producer, subscribers) = broadcast::<u32, ()>();
        let hits = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..8 {
            let observed = hits.clone();
            subscribers.subscribe(move |outcome| {
                assert_eq!(outcome, Outcome::Value(3));
                observed.fetch_add(1, StdOrdering::SeqCst);
            });
        }
        producer.complete_value(3);
        assert_eq!(hits.load(StdOrdering::SeqCst), 8);
    }

    #[test]
    fn post_seal_attaches_read_directly() {
        let (producer, subscribers) = broadcast::<u32, ()>();
        producer.complete_value(4);
        // Subscribing late still observes the value, synchronously.
        assert_eq!(subscribers.try_get(), Some(Outcome::Value(4)));
        let forked = subscribers.fork();
        assert_eq!(forked.try_take().unwrap(), Outcome::Value(4));
    }

    #[test]
    fn all_readers_observe_equal_values() {
        let (producer, subscribers) = broadcast::<Vec<u32>, ()>();
        let forks: Vec<_> = (0..4).map(|_| subscribers.fork()).collect();
        producer.complete_value(vec![1, 2, 3]);
        for fork in forks {
            assert_eq!(fork.try_take().unwrap(), Outcome::Value(vec![1, 2, 3]));
        }
        assert_eq!(subscribers.try_get(), Some(Outcome::Value(vec![1, 2, 3])));
    }

    #[test]
    fn dropped_producer_broadcasts_abandonment() {
        let (producer, subscribers) = broadcast::<u32, ()>();
        let fork = subscribers.fork();
        drop(producer);
        match fork.try_take().unwrap() {
            Outcome::Panicked(exception) => assert!(exception.is_abandoned()),
            other => panic!("expected abandonment, got {other:?}"),
        }
    }

    #[test]
    fn chained_broadcast_values_copy_per_subscriber() {
        let (producer, subscribers) = broadcast::<u32, ()>();
        let a = subscribers.then(|outcome| outcome.map(|v| v + 1));
        let b = subscribers.then(|outcome| outcome.map(|v| v * 2));
        producer.complete_value(10);
        assert_eq!(a.try_take().unwrap(), Outcome::Value(11));
        assert_eq!(b.try_take().unwrap(), Outcome::Value(20));
    }

    #[test]
    fn blocking_get_across_threads() {
        let (producer, subscribers) = broadcast::<u32, ()>();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(core::time::Duration::from_millis(10));
            producer.complete_value(6);
        });
        assert_eq!(subscribers.get(), Outcome::Value(6));
        handle.join().unwrap();
    }

}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom;

    #[test]
    fn subscribe_races_the_seal() {
        loom::model(|| {
            let (producer, subscribers) = broadcast::<u32, ()>();
            let sealer = loom::thread::spawn(move || {
                producer.complete_value(1);
            });
            let fork = subscribers.fork();
            sealer.join().unwrap();
            assert_eq!(fork.get(), Outcome::Value(1));
        });
    }
}
