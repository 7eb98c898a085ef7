// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The completion cell state machine.
//!
//! One `AtomicUsize` per cell packs a 3-bit state tag together with an
//! observer pointer, so tag and payload change in a single atomic
//! operation — no lock, no double-width CAS. The producer side performs
//! exactly one [`Machine::resolve`]; the consumer side performs at most
//! one [`Machine::try_attach`]. Whichever write lands second observes
//! the other side and is responsible for driving delivery; the loser
//! returns early. This makes the protocol correct regardless of which
//! side runs first.
//!
//! Observers are *thin* pointers: every attachable node embeds an
//! 8-aligned [`ObserverHeader`] whose hand-rolled vtable carries the
//! node's behavior, the same shape the pointer-packed task machinery of
//! a scheduler uses. Resolution does not recurse into continuations;
//! each step returns "the next thing to run" and the [`drive`] loop
//! executes steps iteratively until the idle sentinel, so resolving an
//! arbitrarily long chain uses constant stack.

use crate::exec::ExecutorRef;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::outcome::Outcome;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use mycelium_bitfield::{bitfield, FromBits};

/// Number of low bits the tag occupies; observer nodes are 8-aligned so
/// these bits of their address are always zero.
const TAG_BITS: usize = 3;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

const RAW_EMPTY: usize = Tag::Empty as usize;
const RAW_RESULT: usize = Tag::Result as usize;

/// The cell's state tag, stored in the low bits of the machine word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Tag {
    /// No result, no observer.
    Empty = 0b000,
    /// Terminal: the slot is filled, the payload bits are unused.
    Result = 0b001,
    /// The observer is a continuation resolved synchronously in place.
    Inline = 0b010,
    /// The observer is a continuation submitted to its executor.
    Call = 0b011,
    /// The observer is a blocking waiter committed to waiting; it will
    /// never be unregistered.
    WaitPinned = 0b100,
    /// The observer is a blocking waiter that a timed wait may revert
    /// via [`Machine::reset`].
    WaitTimed = 0b101,
}

impl FromBits<usize> for Tag {
    const BITS: u32 = TAG_BITS as u32;
    type Error = core::convert::Infallible;

    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        Ok(match bits {
            bits if bits == Self::Empty as usize => Self::Empty,
            bits if bits == Self::Result as usize => Self::Result,
            bits if bits == Self::Inline as usize => Self::Inline,
            bits if bits == Self::Call as usize => Self::Call,
            bits if bits == Self::WaitPinned as usize => Self::WaitPinned,
            bits if bits == Self::WaitTimed as usize => Self::WaitTimed,
            _ => unreachable!("invalid cell tag"),
        })
    }

    fn into_bits(self) -> usize {
        self as usize
    }
}

bitfield! {
    /// One machine word: the state tag plus the observer address shifted
    /// right by the tag width.
    #[derive(Eq, PartialEq)]
    pub(crate) struct Word<usize> {
        /// The cell's state.
        const TAG: Tag;
        /// The observer pointer (address >> 3), or zero.
        const PTR = ..;
    }
}

impl Word {
    fn pack(tag: Tag, observer: NonNull<ObserverHeader>) -> Self {
        let addr = observer.as_ptr() as usize;
        debug_assert_eq!(addr & TAG_MASK, 0, "observer nodes must be 8-aligned");
        Self::new().with(Self::TAG, tag).with(Self::PTR, addr >> TAG_BITS)
    }

    pub(crate) fn tag(self) -> Tag {
        self.get(Self::TAG)
    }

    /// Decodes the observer pointer, if this word holds one.
    pub(crate) fn observer(self) -> Option<NonNull<ObserverHeader>> {
        match self.tag() {
            Tag::Empty | Tag::Result => None,
            _ => NonNull::new((self.get(Self::PTR) << TAG_BITS) as *mut ObserverHeader),
        }
    }
}

/// The atomic tagged-state word of one completion cell.
pub(crate) struct Machine {
    word: AtomicUsize,
}

impl Machine {
    loom_const_fn! {
        /// A cell with no result and no observer.
        pub(crate) const fn unresolved() -> Machine {
            Machine { word: AtomicUsize::new(RAW_EMPTY) }
        }
    }

    loom_const_fn! {
        /// A cell born in the terminal state (the ready-made factory).
        pub(crate) const fn pre_resolved() -> Machine {
            Machine { word: AtomicUsize::new(RAW_RESULT) }
        }
    }

    fn load(&self, order: Ordering) -> Word {
        Word::from_bits(self.word.load(order))
    }

    /// `true` only when the word is exactly `Empty`.
    pub(crate) fn is_empty(&self) -> bool {
        self.load(Ordering::Acquire).tag() == Tag::Empty
    }

    /// `true` once the producer's write has landed.
    pub(crate) fn is_resolved(&self) -> bool {
        self.load(Ordering::Acquire).tag() == Tag::Result
    }

    /// Attempts to register `observer` on an empty cell.
    ///
    /// Returns `false` when the cell already holds a result, in which
    /// case the caller must consume the (now visible) slot itself. Any
    /// prior state other than `Empty`/`Result` means a second observer
    /// was attached, which is a contract violation.
    pub(crate) fn try_attach(&self, observer: NonNull<ObserverHeader>, tag: Tag) -> bool {
        debug_assert!(matches!(
            tag,
            Tag::Inline | Tag::Call | Tag::WaitPinned | Tag::WaitTimed
        ));
        let new = Word::pack(tag, observer);
        match self
            .word
            .compare_exchange(RAW_EMPTY, new.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::trace!(target: "handoff::cell", ?observer, ?tag, "attached");
                true
            }
            Err(actual) => {
                if Word::from_bits(actual).tag() != Tag::Result {
                    violation!("attached a second observer to a completion cell");
                }
                false
            }
        }
    }

    /// Marks the cell terminal, returning the prior word.
    ///
    /// The caller decodes the prior word and fires the observer it
    /// encodes, if any. Resolving twice is a contract violation.
    pub(crate) fn resolve(&self) -> Word {
        let prev = Word::from_bits(self.word.swap(RAW_RESULT, Ordering::AcqRel));
        if prev.tag() == Tag::Result {
            violation!("completion cell resolved twice");
        }
        tracing::trace!(target: "handoff::cell", prior = ?prev.tag(), "resolved");
        prev
    }

    /// Attempts to revert a waiter registration back to `Empty`.
    ///
    /// Returns `false` if the cell resolved first; the notification is
    /// then in flight and the waiter must be waited out before its
    /// storage may be reused.
    pub(crate) fn reset(&self) -> bool {
        let cur = self.word.load(Ordering::Relaxed);
        let tag = Word::from_bits(cur).tag();
        if tag == Tag::Result {
            return false;
        }
        debug_assert!(
            matches!(tag, Tag::WaitPinned | Tag::WaitTimed),
            "reset a cell that holds no waiter"
        );
        self.word
            .compare_exchange(cur, RAW_EMPTY, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Machine")
            .field(&self.load(Ordering::Relaxed).tag())
            .finish()
    }
}

// === observers ===

/// First field of every attachable node. Must be 8-aligned so the node's
/// address packs into a [`Word`] above the tag bits.
#[repr(C, align(8))]
pub(crate) struct ObserverHeader {
    pub(crate) vtable: &'static ObserverVTable,
}

impl fmt::Debug for ObserverHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHeader").finish_non_exhaustive()
    }
}

/// Behavior of an attachable node, dispatched through a thin pointer.
///
/// Exactly one of `resolved`/`abandoned` is invoked per attachment,
/// exactly once; `run` is the executor entry point of nodes that were
/// submitted as a [`Job`](crate::exec::Job) rather than resolved in
/// place.
pub(crate) struct ObserverVTable {
    /// The observed cell reached `Result`: do the node's work (or submit
    /// it to an executor) and return the next step for the trampoline.
    pub(crate) resolved: unsafe fn(NonNull<ObserverHeader>) -> Step,
    /// Execute a node that was previously submitted to an executor.
    pub(crate) run: unsafe fn(NonNull<ObserverHeader>) -> Step,
    /// The attachment is torn down without a result (producer dropped,
    /// or the executor refused the job).
    pub(crate) abandoned: unsafe fn(NonNull<ObserverHeader>) -> Step,
}

/// What the trampoline should do next.
#[derive(Debug)]
pub(crate) enum Step {
    /// Nothing left to run.
    Idle,
    /// Invoke this observer's `resolved` entry next.
    Resolve(NonNull<ObserverHeader>),
}

/// Which vtable entry a resolution fires on the decoded observer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Fire {
    /// A real result exists.
    Resolved,
    /// The producer side is gone; the slot carries the abandonment
    /// exception.
    Abandoned,
}

/// The trampoline: repeatedly runs "the next thing to run" until the
/// idle sentinel, bounding stack growth independent of chain length.
pub(crate) fn drive(mut step: Step) {
    while let Step::Resolve(observer) = step {
        // Safety: a `Step::Resolve` pointer was produced by a resolution
        // that owns the (single) right to fire this observer.
        step = unsafe { (observer.as_ref().vtable.resolved)(observer) };
    }
}

// === cells ===

/// Shared prefix of every cell allocation (`repr(C)`, always at offset
/// zero), carrying the state word, the intrusive reference count, and
/// the vtable that knows how to count and destroy the concrete
/// allocation.
#[repr(C)]
pub(crate) struct CellHeader {
    pub(crate) machine: Machine,
    pub(crate) count: AtomicUsize,
    pub(crate) vtable: &'static CellVTable,
}

/// Reference-count strategy and typed destruction for one concrete cell
/// allocation. See [`crate::count`] for the strategy implementations.
pub(crate) struct CellVTable {
    pub(crate) retain: unsafe fn(NonNull<CellHeader>),
    /// Returns `true` when this release destroyed the allocation.
    pub(crate) release: unsafe fn(NonNull<CellHeader>) -> bool,
}

/// The typed core of a completion cell: header, executor affinity and
/// the result slot. Every cell allocation begins with one of these.
///
/// The slot is guarded by the machine word: the producer writes it
/// before the `resolve` exchange publishes it, consumers read it only
/// after observing `Result`.
#[repr(C)]
pub(crate) struct Core<V, E> {
    pub(crate) header: CellHeader,
    /// Where a continuation represented by this cell should run. `None`
    /// is the synchronous inline executor.
    executor: Option<ExecutorRef>,
    slot: UnsafeCell<Option<Outcome<V, E>>>,
}

impl<V, E> Core<V, E> {
    pub(crate) fn new(
        vtable: &'static CellVTable,
        refs: usize,
        executor: Option<ExecutorRef>,
    ) -> Self {
        Self {
            header: CellHeader {
                machine: Machine::unresolved(),
                count: AtomicUsize::new(refs),
                vtable,
            },
            executor,
            slot: UnsafeCell::new(None),
        }
    }

    /// A cell born already resolved (the ready-made factory).
    pub(crate) fn ready(vtable: &'static CellVTable, refs: usize, outcome: Outcome<V, E>) -> Self {
        Self {
            header: CellHeader {
                machine: Machine::pre_resolved(),
                count: AtomicUsize::new(refs),
                vtable,
            },
            executor: None,
            slot: UnsafeCell::new(Some(outcome)),
        }
    }

    pub(crate) fn executor(&self) -> Option<&ExecutorRef> {
        self.executor.as_ref()
    }

    pub(crate) fn machine(&self) -> &Machine {
        &self.header.machine
    }

    /// Writes the slot. The producer side calls this exactly once,
    /// before [`Self::resolve`] publishes the write.
    ///
    /// # Safety
    ///
    /// The caller must be the sole producer and must not have resolved
    /// the cell yet.
    pub(crate) unsafe fn store(&self, outcome: Outcome<V, E>) {
        self.slot.with_mut(|slot| {
            // Safety: producer exclusivity is promised by the caller; no
            // consumer reads the slot before the resolve exchange.
            let slot = unsafe { &mut *slot };
            debug_assert!(slot.is_none(), "result slot written twice");
            *slot = Some(outcome);
        });
    }

    /// Moves the result out of the slot.
    ///
    /// # Safety
    ///
    /// The caller must have observed `Result` (with acquire ordering)
    /// and hold the sole consumer-side right to the value.
    pub(crate) unsafe fn take(&self) -> Outcome<V, E> {
        self.slot.with_mut(|slot| {
            // Safety: promised by the caller.
            match unsafe { (*slot).take() } {
                Some(outcome) => outcome,
                None => violation!("consumed a completion that holds no result"),
            }
        })
    }

    /// Marks the cell resolved and fires the registered observer, if
    /// any, returning the next trampoline step.
    pub(crate) fn resolve(&self, fire: Fire) -> Step {
        let prev = self.header.machine.resolve();
        match prev.observer() {
            None => Step::Idle,
            Some(observer) => match fire {
                Fire::Resolved => Step::Resolve(observer),
                // Safety: decoding the observer out of the word hands us
                // the single right to fire it.
                Fire::Abandoned => unsafe { (observer.as_ref().vtable.abandoned)(observer) },
            },
        }
    }
}

/// An owning, typed handle to a cell allocation whose prefix is
/// `Core<V, E>`. Cloning and dropping go through the cell vtable, so
/// the counting strategy is whatever the allocation installed.
pub(crate) struct CoreRef<V, E> {
    ptr: NonNull<Core<V, E>>,
    _marker: PhantomData<Core<V, E>>,
}

impl<V, E> CoreRef<V, E> {
    /// Adopts an assumed pre-existing reference: no increment happens.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live allocation beginning with
    /// `Core<V, E>` whose reference count already includes the
    /// reference being adopted.
    pub(crate) unsafe fn adopt(ptr: NonNull<Core<V, E>>) -> Self {
        // Safety: `ptr` is promised live by the caller.
        debug_assert!(
            unsafe { ptr.as_ref() }.header.count.load(Ordering::Relaxed) >= 1,
            "adopted a reference that was never created"
        );
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<CellHeader> {
        self.ptr.cast()
    }

    pub(crate) fn core(&self) -> &Core<V, E> {
        // Safety: the handle keeps the allocation alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<V, E> Clone for CoreRef<V, E> {
    fn clone(&self) -> Self {
        // Safety: the header is live and its vtable matches the
        // allocation by construction.
        unsafe { (self.core().header.vtable.retain)(self.header_ptr()) };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<V, E> Drop for CoreRef<V, E> {
    fn drop(&mut self) {
        let release = self.core().header.vtable.release;
        // Safety: as above; after this call the pointer may dangle and
        // is not touched again.
        unsafe { release(self.header_ptr()) };
    }
}

impl<V, E> fmt::Debug for CoreRef<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreRef")
            .field("machine", self.core().machine())
            .finish()
    }
}

// Safety: the slot is handed across threads only through the acquire /
// release protocol on the machine word, and the count strategies order
// destruction with a release decrement + acquire fence.
unsafe impl<V: Send, E: Send> Send for CoreRef<V, E> {}
// Safety: shared access to a cell only touches the atomic header word;
// slot reads require `V: Sync`-free exclusivity guaranteed by protocol.
unsafe impl<V: Send, E: Send> Sync for CoreRef<V, E> {}

/// Allocates a concrete cell allocation and adopts a handle to its core
/// prefix, with `refs` already baked into the count.
///
/// # Safety
///
/// `T` must be `repr(C)` with a `Core<V, E>` as its first field, and its
/// vtable's `release` must deallocate a `Box<T>`.
pub(crate) unsafe fn allocate<T, V, E>(allocation: T) -> (NonNull<T>, CoreRef<V, E>) {
    let ptr = NonNull::from(alloc::boxed::Box::leak(alloc::boxed::Box::new(allocation)));
    // Safety: `T` begins with `Core<V, E>` (promised by the caller), and
    // the allocation's count was initialized to include this handle.
    let handle = unsafe { CoreRef::adopt(ptr.cast::<Core<V, E>>()) };
    (ptr, handle)
}
